//! journal_verify - Offline verifier for the Field Sentinel journal
//!
//! This tool proves:
//! - The journal is hash-chained (truncation or edits are detected)
//! - Which dispatch records were delivered, are still pending, or were abandoned
//!
//! Abandoned records are undelivered emergency alerts and are always listed.

use anyhow::{anyhow, Result};
use clap::Parser;
use rusqlite::Connection;
use std::path::Path;

use field_sentinel::dispatch::{abandoned_records, status_counts};
use field_sentinel::journal::verify_chain_with;

#[derive(Parser, Debug)]
#[command(
    name = "journal_verify",
    about = "Verify Field Sentinel journal integrity and report dispatch status"
)]
struct Args {
    /// Path to the sentinel SQLite DB
    #[arg(long, default_value = "sentinel.db")]
    db: String,

    /// Verbose output
    #[arg(short, long)]
    verbose: bool,
}

fn main() -> Result<()> {
    let args = Args::parse();
    if !Path::new(&args.db).exists() {
        return Err(anyhow!("database {} does not exist", args.db));
    }
    let conn = Connection::open(&args.db)?;

    println!("journal_verify: checking {}", args.db);
    println!();

    println!("=== Journal ===");
    let report = verify_chain_with(&conn, |id, kind, entry_hash| {
        if args.verbose {
            println!("  entry {} ({}): hash={} OK", id, kind, &hex::encode(entry_hash)[..16]);
        }
    })?;
    println!(
        "verified {} journal entries, head={}",
        report.entries,
        hex::encode(report.head)
    );
    println!();

    println!("=== Dispatch ===");
    let counts = status_counts(&conn)?;
    if counts.is_empty() {
        println!("no dispatch records");
    }
    for (status, count) in &counts {
        println!("  {:<10} {}", status.as_str(), count);
    }

    let abandoned = abandoned_records(&conn)?;
    if !abandoned.is_empty() {
        println!();
        println!("WARNING: {} alert deliveries abandoned", abandoned.len());
        for record in &abandoned {
            println!(
                "  ABANDONED {} -> {} after {} attempts: {}",
                record.alert_id,
                record.destination,
                record.attempts,
                record.last_error.as_deref().unwrap_or("no error recorded")
            );
            if args.verbose {
                for line in record.body.lines() {
                    println!("    | {}", line);
                }
            }
        }
    }

    println!();
    println!("OK: journal chain verified.");
    Ok(())
}
