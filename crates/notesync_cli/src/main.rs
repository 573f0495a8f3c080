//! Command-line status check for a notesync replica.
//!
//! # Responsibility
//! - Verify `notesync_core` linkage (`ping`, version).
//! - Print the `status` summary of a replica database when one is given.

use clap::Parser;
use log::info;
use notesync_core::{
    default_log_level, init_logging, open_db, EntityStore, LoggingConfig, SyncConfig, SyncSession,
    UserId,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Debug, Parser)]
#[command(name = "notesync_cli", version, about = "Summarize a notesync replica")]
struct Args {
    /// Replica database to summarize
    #[arg(long)]
    db: Option<PathBuf>,
    /// Narrow the summary to one owner
    #[arg(long, value_parser = parse_owner)]
    owner: Option<UserId>,
    /// Absolute directory for rolling log files
    #[arg(long)]
    log_dir: Option<PathBuf>,
}

fn parse_owner(raw: &str) -> Result<UserId, String> {
    UserId::parse(raw).map_err(|err| err.to_string())
}

fn run(args: Args) -> Result<(), String> {
    println!("notesync_core ping={}", notesync_core::ping());
    println!("notesync_core version={}", notesync_core::core_version());

    if let Some(log_dir) = args.log_dir {
        init_logging(&LoggingConfig::new(default_log_level(), log_dir))?;
    }

    let Some(db_path) = args.db else {
        return Ok(());
    };
    let conn = open_db(&db_path).map_err(|err| format!("failed to open database: {err}"))?;
    let session = SyncSession::new(
        EntityStore::durable_only(&conn),
        None,
        SyncConfig::default(),
    );
    let status = session
        .status(args.owner.as_ref())
        .map_err(|err| format!("status failed: {err}"))?;
    let peer = session
        .local_peer_id()
        .map_err(|err| format!("peer id unavailable: {err}"))?;

    info!(
        "event=cli_status module=cli status=ok notes={} categories={}",
        status.note_count, status.category_count
    );
    println!("peer={peer}");
    println!("notes={}", status.note_count);
    println!("categories={}", status.category_count);
    println!("checksum={}", status.checksum);
    Ok(())
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(message) => {
            eprintln!("error: {message}");
            ExitCode::FAILURE
        }
    }
}
