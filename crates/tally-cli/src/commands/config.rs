use std::path::Path;

use crate::commands::common::open_service;
use crate::error::CliError;

pub async fn run_config_endpoint(
    url: &str,
    key: &str,
    enabled: bool,
    db_path: &Path,
    passphrase: Option<String>,
) -> Result<(), CliError> {
    let service = open_service(db_path, passphrase).await?;
    service.save_endpoint(url, key, enabled).await?;

    let sealed = if service.vault().is_unlocked() {
        "encrypted"
    } else {
        "stored in plaintext; pass --passphrase to encrypt it"
    };
    let state = if enabled { "enabled" } else { "disabled" };
    println!("Sync endpoint saved ({state}), key {sealed}");
    Ok(())
}
