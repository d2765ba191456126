// keys/fingerprint.rs - Key Fingerprints

use sha2::{Digest, Sha256, Sha512};

use crate::config::HashType;

/// Render a digest as colon-separated lowercase hex byte pairs
pub fn colon_hex(digest: &[u8]) -> String {
    digest
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect::<Vec<_>>()
        .join(":")
}

/// Digest `data` with the configured hash
pub fn digest(data: &[u8], hash_type: HashType) -> Vec<u8> {
    match hash_type {
        HashType::Sha256 => Sha256::digest(data).to_vec(),
        HashType::Sha512 => Sha512::digest(data).to_vec(),
    }
}

/// Fingerprint of a PEM-armoured key.
///
/// The armour lines (first and last) are dropped and the body, newlines
/// included, is hashed.
pub fn pem_finger(pem: &str, hash_type: HashType) -> String {
    let lines: Vec<&str> = pem.split_inclusive('\n').collect();
    let body = match lines.len() {
        0..=2 => String::new(),
        n => lines[1..n - 1].concat(),
    };
    colon_hex(&digest(body.as_bytes(), hash_type))
}

/// Text form of a structured remote key
pub fn remote_key_text(public_key: &str, verify_key: &str) -> String {
    format!("pub: {public_key}\nverify: {verify_key}")
}

/// Fingerprint of a structured remote key: plain sha256 hex of its text form
pub fn remote_finger(public_key: &str, verify_key: &str) -> String {
    hex::encode(Sha256::digest(remote_key_text(public_key, verify_key).as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const PEM: &str = "-----BEGIN PUBLIC KEY-----\nAAAA\nBBBB\n-----END PUBLIC KEY-----\n";

    #[test]
    fn test_pem_finger_hashes_body_only() {
        let expected = colon_hex(&Sha256::digest(b"AAAA\nBBBB\n"));
        assert_eq!(pem_finger(PEM, HashType::Sha256), expected);

        let rewrapped = PEM.replace("PUBLIC KEY", "RSA PUBLIC KEY");
        assert_eq!(pem_finger(&rewrapped, HashType::Sha256), expected);
    }

    #[test]
    fn test_pem_finger_format() {
        let finger = pem_finger(PEM, HashType::Sha256);
        assert_eq!(finger.len(), 32 * 3 - 1);
        assert!(finger.split(':').all(|pair| pair.len() == 2));

        let long = pem_finger(PEM, HashType::Sha512);
        assert_eq!(long.split(':').count(), 64);
    }

    #[test]
    fn test_remote_finger() {
        assert_eq!(remote_key_text("p", "v"), "pub: p\nverify: v");
        assert_eq!(
            remote_finger("p", "v"),
            hex::encode(Sha256::digest(b"pub: p\nverify: v"))
        );
        assert_ne!(remote_finger("p", "v"), remote_finger("v", "p"));
    }
}
