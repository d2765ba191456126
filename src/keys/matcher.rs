// keys/matcher.rs - Glob Matching over Key Listings

use glob::Pattern;
use tracing::debug;

use super::state::{KeyMatches, KeyState, KeyStatus};
use super::store::{sort_ids, KeyStore};

/// Which groups a lookup considers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum MatchScope {
    /// Managed partitions only
    #[default]
    Active,
    /// Managed partitions plus the controller's local identity files
    All,
}

#[derive(Debug, Clone)]
enum Alternative {
    Glob(Pattern),
    Literal(String),
}

impl Alternative {
    fn compile(pattern: &str) -> Self {
        match Pattern::new(pattern) {
            Ok(glob) => Alternative::Glob(glob),
            Err(e) => {
                debug!(pattern, error = %e, "Not a valid glob, matching literally");
                Alternative::Literal(pattern.to_string())
            }
        }
    }

    fn matches(&self, id: &str) -> bool {
        match self {
            Alternative::Glob(glob) => glob.matches(id),
            Alternative::Literal(literal) => literal == id,
        }
    }
}

/// A compiled key pattern: one glob, or several joined by commas and OR-ed
#[derive(Debug, Clone)]
pub struct KeyGlob {
    alternatives: Vec<Alternative>,
}

impl KeyGlob {
    /// Compile a pattern, splitting comma-joined alternatives
    pub fn parse(pattern: &str) -> Self {
        Self {
            alternatives: pattern.split(',').map(Alternative::compile).collect(),
        }
    }

    /// Compile a single glob; commas are taken literally
    pub fn single(pattern: &str) -> Self {
        Self {
            alternatives: vec![Alternative::compile(pattern)],
        }
    }

    pub fn matches(&self, id: &str) -> bool {
        self.alternatives.iter().any(|alt| alt.matches(id))
    }
}

/// Filter grouped listings through a pattern. Groups without a match are
/// left out; ids within a group stay sorted.
pub fn match_listing<I>(listing: I, pattern: &str) -> KeyMatches
where
    I: IntoIterator<Item = (KeyStatus, Vec<String>)>,
{
    let glob = KeyGlob::parse(pattern);
    let mut matches = KeyMatches::new();
    for (status, ids) in listing {
        let mut hits: Vec<String> = ids.into_iter().filter(|id| glob.matches(id)).collect();
        if hits.is_empty() {
            continue;
        }
        sort_ids(&mut hits);
        matches.entry(status).or_default().extend(hits);
    }
    matches
}

/// Re-check a previously computed match against the store as it is now.
///
/// Each supplied id is looked up in every partition, so the result reports
/// where the key lives at this moment. Ids that vanished are dropped.
pub fn dict_match<S: KeyState>(store: &KeyStore<S>, explicit: &KeyMatches) -> KeyMatches {
    let current = store.list_all();
    let mut matches = KeyMatches::new();

    for ids in explicit.values() {
        for id in ids {
            let glob = KeyGlob::single(id);
            for (state, present) in &current {
                if present.iter().any(|p| glob.matches(p)) {
                    matches.entry(state.status()).or_default().push(id.clone());
                }
            }
        }
    }

    for ids in matches.values_mut() {
        sort_ids(ids);
        ids.dedup();
    }
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::state::ZmqState;
    use proptest::prelude::*;

    fn listing() -> Vec<(KeyStatus, Vec<String>)> {
        vec![
            (
                KeyStatus::Accepted,
                vec!["alpha".into(), "beta".into(), "web1".into()],
            ),
            (KeyStatus::Pending, vec!["web2".into(), "db1".into()]),
            (KeyStatus::Rejected, vec![]),
        ]
    }

    #[test]
    fn test_single_glob() {
        let matches = match_listing(listing(), "web*");
        assert_eq!(matches[&KeyStatus::Accepted], vec!["web1"]);
        assert_eq!(matches[&KeyStatus::Pending], vec!["web2"]);
        assert!(!matches.contains_key(&KeyStatus::Rejected));
    }

    #[test]
    fn test_comma_alternatives() {
        let matches = match_listing(listing(), "alpha,db?");
        assert_eq!(matches[&KeyStatus::Accepted], vec!["alpha"]);
        assert_eq!(matches[&KeyStatus::Pending], vec!["db1"]);
    }

    #[test]
    fn test_no_match_is_empty() {
        assert!(match_listing(listing(), "nothing*").is_empty());
    }

    #[test]
    fn test_invalid_glob_matches_literally() {
        let listing = vec![(KeyStatus::Pending, vec!["odd[".to_string(), "odd".to_string()])];
        let matches = match_listing(listing, "odd[");
        assert_eq!(matches[&KeyStatus::Pending], vec!["odd["]);
    }

    #[test]
    fn test_dict_match_reports_current_location() {
        let dir = tempfile::tempdir().unwrap();
        let store: KeyStore<ZmqState> = KeyStore::new(dir.path());
        store.ensure_partitions().unwrap();
        store.write("m1", ZmqState::Accepted, b"k").unwrap();
        store.write("m2", ZmqState::Rejected, b"k").unwrap();

        let mut explicit = KeyMatches::new();
        explicit.insert(
            KeyStatus::Pending,
            vec!["m1".into(), "m2".into(), "gone".into()],
        );

        let matches = dict_match(&store, &explicit);
        assert_eq!(matches[&KeyStatus::Accepted], vec!["m1"]);
        assert_eq!(matches[&KeyStatus::Rejected], vec!["m2"]);
        assert!(!matches.contains_key(&KeyStatus::Pending));
    }

    fn union(a: &KeyMatches, b: &KeyMatches) -> KeyMatches {
        let mut out = a.clone();
        for (status, ids) in b {
            let entry = out.entry(*status).or_default();
            for id in ids {
                if !entry.contains(id) {
                    entry.push(id.clone());
                }
            }
            sort_ids(entry);
        }
        out
    }

    proptest! {
        #[test]
        fn prop_comma_is_union(
            ids in proptest::collection::btree_set("[a-d][a-d0-9]{0,3}", 0..12),
            p1 in "[a-d][*?]?",
            p2 in "[a-d][*?]?",
        ) {
            let ids: Vec<String> = ids.into_iter().collect();
            let listing = vec![(KeyStatus::Pending, ids)];

            let left = match_listing(listing.clone(), &p1);
            let right = match_listing(listing.clone(), &p2);
            let both = match_listing(listing, &format!("{p1},{p2}"));

            prop_assert_eq!(both, union(&left, &right));
        }
    }
}
