use std::path::Path;

use tally_core::{ConflictPolicy, SyncStrategy, SyncTable};

use crate::commands::common::{format_result_lines, format_status_lines, open_service};
use crate::error::CliError;

pub async fn run_status(
    as_json: bool,
    db_path: &Path,
    passphrase: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, passphrase).await?;
    let status = service.get_sync_status().await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        for line in format_status_lines(&status) {
            println!("{line}");
        }
    }
    Ok(())
}

pub async fn run_sync(
    strategy: SyncStrategy,
    as_json: bool,
    db_path: &Path,
    passphrase: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, passphrase).await?;
    let result = service.run_strategy(strategy).await?;

    if as_json {
        println!("{}", serde_json::to_string_pretty(&result)?);
        return Ok(());
    }

    println!("Sync completed ({strategy})");
    for line in format_result_lines(&result) {
        println!("{line}");
    }
    Ok(())
}

pub async fn run_policy(
    policy: ConflictPolicy,
    db_path: &Path,
    passphrase: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, passphrase).await?;
    service.set_conflict_policy(policy).await?;
    println!("Conflict policy: {policy}");
    Ok(())
}

pub async fn run_watch(db_path: &Path, passphrase: Option<String>) -> Result<(), CliError> {
    let service = open_service(db_path, passphrase).await?;
    service.start_realtime().await?;
    let tables = SyncTable::RECORDS
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ");
    println!("Watching {tables} for remote changes (Ctrl-C to stop)");

    tokio::signal::ctrl_c().await?;
    service.stop_realtime().await?;
    println!("Applied {} remote changes", service.realtime_applied_count());
    Ok(())
}
