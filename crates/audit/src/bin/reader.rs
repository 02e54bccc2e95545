//! Audit log reader CLI.

use clap::Parser;
use lynkr_audit::reader::{self, ReadOptions};
use lynkr_config::AuditConfig;

#[derive(Debug, Parser)]
#[command(name = "lynkr-audit", about = "Read and verify the Lynkr audit log", version)]
struct Args {
    /// Path to the audit log file.
    #[arg(long)]
    log: Option<String>,

    /// Path to the content dictionary file.
    #[arg(long)]
    dictionary: Option<String>,

    /// Resolve $ref entries to full content.
    #[arg(long)]
    full: bool,

    /// Filter records by top-level field, as key=value. Repeatable.
    #[arg(long = "filter", value_name = "KEY=VALUE")]
    filters: Vec<String>,

    /// Only records with this correlation id.
    #[arg(long)]
    correlation_id: Option<String>,

    /// Only the last N matching records.
    #[arg(long, value_name = "N")]
    last: Option<usize>,

    /// Print aggregate statistics instead of records.
    #[arg(long)]
    stats: bool,

    /// Verify that every reference resolves; exits non-zero otherwise.
    #[arg(long)]
    verify: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = AuditConfig::default();
    if let Some(log) = args.log {
        config.log_path = log;
    }
    if let Some(dictionary) = args.dictionary {
        config.dictionary_path = dictionary;
    }

    if args.verify {
        let unresolved = reader::verify(&config)?;

        if unresolved > 0 {
            eprintln!("FAIL: {unresolved} unresolved reference(s)");
            std::process::exit(1);
        }

        println!("OK: all references resolve");
        return Ok(());
    }

    if args.stats {
        let stats = reader::stats(&config)?;
        println!("{}", serde_json::to_string_pretty(&stats)?);
        return Ok(());
    }

    let filters = args
        .filters
        .iter()
        .filter_map(|raw| {
            raw.split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
        })
        .collect();

    let options = ReadOptions {
        full: args.full,
        filters,
        correlation_id: args.correlation_id,
        last: args.last,
    };

    for record in reader::read(&config, &options)? {
        println!("{record}");
    }

    Ok(())
}
