//! Dictionary compaction CLI.

use std::path::PathBuf;

use clap::Parser;
use lynkr_audit::compact;
use lynkr_config::AuditConfig;

#[derive(Debug, Parser)]
#[command(
    name = "lynkr-compact",
    about = "Collapse repeated Lynkr dictionary entries into canonical lines",
    version
)]
struct Args {
    /// Path to the content dictionary file.
    #[arg(long)]
    dictionary: Option<String>,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let path = PathBuf::from(
        args.dictionary
            .unwrap_or_else(|| AuditConfig::default().dictionary_path),
    );

    let report = compact::compact(&path)?;

    println!(
        "compacted {} line(s) into {} entr(ies); {} without content",
        report.lines_before, report.entries_after, report.missing_content
    );

    if report.missing_content > 0 {
        std::process::exit(1);
    }

    Ok(())
}
