// bin/minion_keys.rs - Minion Key Admin Tool
//
//! Command line interface for managing minion keys.
//!
//! # Usage
//!
//! ```bash
//! # List every managed key
//! minion-keys list
//!
//! # Accept pending keys matching a glob
//! minion-keys accept 'web*'
//!
//! # Delete a key and drop its live session
//! minion-keys delete db1 --revoke-auth
//!
//! # Show fingerprints as JSON
//! minion-keys --format json finger
//! ```

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use colored::{ColoredString, Colorize};
use serde::Serialize;
use std::path::PathBuf;

use minion_keys::keys::{BatchReport, KeyDetails, StatusFilter};
use minion_keys::{
    describe_metrics, init_tracing, AcceptOptions, DeleteOptions, KeyConfig, KeyManager,
    KeyMatches, KeyStatus, RejectOptions, TracingConfig, TracingFormat, Transition,
};

/// Minion key admin tool
#[derive(Parser, Debug)]
#[command(name = "minion-keys")]
#[command(version)]
#[command(about = "Manage the trust state of minion public keys")]
#[command(long_about = None)]
struct Args {
    /// Configuration file (toml, yaml or json)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Output format (text, json)
    #[arg(short, long, default_value = "text", global = true)]
    format: OutputFormat,

    /// Log format (pretty, compact, json)
    #[arg(long, default_value = "compact", global = true)]
    log_format: TracingFormat,

    /// Increase log verbosity
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List keys, optionally only one status (acc, pre, un, rej, den, all)
    List {
        #[arg(default_value = "all")]
        status: String,
    },

    /// Accept pending keys
    Accept {
        /// Glob(s), comma separated
        #[arg(required_unless_present = "all")]
        pattern: Option<String>,

        /// Accept every pending key
        #[arg(short, long)]
        all: bool,

        /// Also accept matching rejected keys
        #[arg(long)]
        include_rejected: bool,

        /// Also accept matching denied keys
        #[arg(long)]
        include_denied: bool,
    },

    /// Reject pending keys
    Reject {
        /// Glob(s), comma separated
        #[arg(required_unless_present = "all")]
        pattern: Option<String>,

        /// Reject every pending key
        #[arg(short, long)]
        all: bool,

        /// Also reject matching accepted keys
        #[arg(long)]
        include_accepted: bool,

        /// Also reject matching denied keys
        #[arg(long)]
        include_denied: bool,
    },

    /// Delete keys
    Delete {
        /// Glob(s), comma separated
        #[arg(required_unless_present_any = ["all", "denied"])]
        pattern: Option<String>,

        /// Delete every key
        #[arg(short, long, conflicts_with = "denied")]
        all: bool,

        /// Delete every denied key
        #[arg(long)]
        denied: bool,

        /// Ask the controller to drop live sessions of deleted minions
        #[arg(long)]
        revoke_auth: bool,

        /// Keep cached data of deleted accepted minions
        #[arg(long)]
        preserve_cache: bool,
    },

    /// Show key fingerprints
    Finger {
        /// Glob(s), comma separated; every key when omitted
        pattern: Option<String>,
    },

    /// Print key contents
    Print {
        /// Glob(s), comma separated; every key when omitted
        pattern: Option<String>,
    },

    /// Purge cached data of minions without a key
    Reconcile,

    /// Check whether the controller is running
    CheckMaster,

    /// Generate a new local identity key (raet)
    GenLocal,
}

fn main() -> Result<()> {
    let args = Args::parse();

    init_tracing(TracingConfig::for_cli(args.verbose).with_format(args.log_format));
    describe_metrics();

    let config = KeyConfig::load(args.config.as_deref()).context("Failed to load configuration")?;
    let manager = KeyManager::new(config).context("Failed to open key store")?;

    match &args.command {
        Commands::List { status } => cmd_list(&args, &manager, status),
        Commands::Accept { pattern, all, include_rejected, include_denied } => {
            let result = match (all, pattern) {
                (true, _) => manager.accept_all(),
                (false, Some(pattern)) => manager.accept(
                    pattern.as_str(),
                    AcceptOptions {
                        include_rejected: *include_rejected,
                        include_denied: *include_denied,
                    },
                ),
                (false, None) => bail!("A pattern or --all is required"),
            };
            print_transition(&args, "Accepted", &result)
        }
        Commands::Reject { pattern, all, include_accepted, include_denied } => {
            let result = match (all, pattern) {
                (true, _) => manager.reject_all(),
                (false, Some(pattern)) => manager.reject(
                    pattern.as_str(),
                    RejectOptions {
                        include_accepted: *include_accepted,
                        include_denied: *include_denied,
                    },
                ),
                (false, None) => bail!("A pattern or --all is required"),
            };
            print_transition(&args, "Rejected", &result)
        }
        Commands::Delete { pattern, all, denied, revoke_auth, preserve_cache } => {
            let result = match (all, denied, pattern) {
                (true, _, _) => manager.delete_all(),
                (false, true, _) => manager.delete_denied(),
                (false, false, Some(pattern)) => manager.delete(
                    pattern.as_str(),
                    DeleteOptions {
                        revoke_auth: *revoke_auth,
                        preserve_cache: *preserve_cache,
                    },
                ),
                (false, false, None) => bail!("A pattern, --all or --denied is required"),
            };
            print_transition(&args, "Deleted", &result)
        }
        Commands::Finger { pattern } => {
            let details = match pattern {
                Some(pattern) => manager.finger(pattern),
                None => manager.finger_all(),
            };
            print_details(&args, &details)
        }
        Commands::Print { pattern } => {
            let details = match pattern {
                Some(pattern) => manager.key_str(pattern),
                None => manager.key_str_all(),
            };
            print_details(&args, &details)
        }
        Commands::Reconcile => {
            let report = manager.reconcile(&[]);
            if args.format == OutputFormat::Json {
                return print_json(&report);
            }
            println!("{} {} cache entries removed", "→".cyan(), report.removed_count());
            for error in &report.errors {
                println!("  {} {}", "Error:".red(), error);
            }
            Ok(())
        }
        Commands::CheckMaster => {
            let running = manager.check_master();
            if args.format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "running": running }));
            }
            let status = if running { "running".green() } else { "not running".red() };
            println!("  {} {}", "Controller:".bold(), status);
            Ok(())
        }
        Commands::GenLocal => {
            let local = manager.generate_local().context("Failed to generate local key")?;
            let finger = local.finger().context("Generated key is unreadable")?;
            if args.format == OutputFormat::Json {
                return print_json(&serde_json::json!({ "finger": finger }));
            }
            println!("{} Local key written", "✓".green());
            println!("  {} {}", "Fingerprint:".bold(), finger);
            Ok(())
        }
    }
}

// =============================================================================
// Command Handlers
// =============================================================================

fn cmd_list(args: &Args, manager: &KeyManager, status: &str) -> Result<()> {
    if StatusFilter::parse(status).is_none() {
        bail!("Unknown key status: {status}");
    }
    let keys = manager.list_status(status);
    if args.format == OutputFormat::Json {
        return print_json(&keys);
    }
    print_matches(&keys);
    Ok(())
}

// =============================================================================
// Output
// =============================================================================

fn heading(status: KeyStatus) -> ColoredString {
    match status {
        KeyStatus::Accepted => "Accepted Keys:".green().bold(),
        KeyStatus::Pending => "Unaccepted Keys:".red().bold(),
        KeyStatus::Rejected => "Rejected Keys:".blue().bold(),
        KeyStatus::Denied => "Denied Keys:".magenta().bold(),
        KeyStatus::Local => "Local Keys:".magenta().bold(),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    let text = serde_json::to_string_pretty(value).context("Failed to render JSON")?;
    println!("{text}");
    Ok(())
}

fn print_matches(keys: &KeyMatches) {
    for (status, ids) in keys {
        println!("{}", heading(*status));
        for id in ids {
            println!("  {id}");
        }
    }
}

fn print_details(args: &Args, details: &KeyDetails) -> Result<()> {
    if args.format == OutputFormat::Json {
        return print_json(details);
    }
    for (status, entries) in details {
        if entries.is_empty() {
            continue;
        }
        println!("{}", heading(*status));
        for (id, value) in entries {
            println!("  {}:  {}", id.bold(), value.trim_end());
        }
    }
    Ok(())
}

fn print_transition(args: &Args, verb: &str, result: &Transition) -> Result<()> {
    if args.format == OutputFormat::Json {
        return print_json(result);
    }
    print_report(verb, &result.report);
    if !result.keys.is_empty() {
        println!();
        print_matches(&result.keys);
    }
    Ok(())
}

fn print_report(verb: &str, report: &BatchReport) {
    let done = report.done();
    if done.is_empty() {
        println!("{} No matching keys", "→".cyan());
    }
    for id in done {
        println!("{} {} {}", "✓".green(), verb, id);
    }
    for change in report.failures() {
        println!(
            "{} {} ({}): {}",
            "✗".red(),
            change.id,
            change.from,
            change.outcome.label()
        );
    }
    for warning in &report.warnings {
        println!("  {} {}", "Warning:".yellow(), warning);
    }
    if report.rotation_requested {
        println!("  {} Session key rotation requested", "→".cyan());
    }
}
