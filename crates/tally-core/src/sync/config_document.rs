//! The `tally-config.json` document kept at the data root.
//!
//! It records where the document tree lives and which categories it holds,
//! and is mirrored at a fixed remote key so every machine converges on the
//! same layout.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::models::{ConflictPolicy, TransferDirection};
use crate::remote::{BlobStore, UploadOutcome};

use super::files::{FileCounts, FileSyncMode};
use super::partial::PartialFailures;

pub const CONFIG_FILE_NAME: &str = "tally-config.json";
pub const CONFIG_REMOTE_KEY: &str = "config/tally-config.json";

/// Highest layout this build understands.
pub const LAYOUT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    pub data_root: String,
    pub layout_version: u32,
    pub categories: Vec<String>,
}

impl ConfigDocument {
    pub fn new(data_root: &Path, categories: &[String]) -> Self {
        Self {
            data_root: data_root.to_string_lossy().into_owned(),
            layout_version: LAYOUT_VERSION,
            categories: categories.to_vec(),
        }
    }

    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let document: Self = serde_json::from_slice(bytes)?;
        document.validate()?;
        Ok(document)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = serde_json::to_vec_pretty(self)?;
        bytes.push(b'\n');
        Ok(bytes)
    }

    fn validate(&self) -> Result<()> {
        if self.data_root.trim().is_empty() {
            return Err(Error::InvalidInput(
                "Config document has an empty dataRoot".to_string(),
            ));
        }
        if self.layout_version == 0 || self.layout_version > LAYOUT_VERSION {
            return Err(Error::InvalidInput(format!(
                "Unsupported config document layoutVersion {} (expected 1..={LAYOUT_VERSION})",
                self.layout_version
            )));
        }
        if self.categories.is_empty() {
            return Err(Error::InvalidInput(
                "Config document lists no categories".to_string(),
            ));
        }
        if let Some(bad) = self
            .categories
            .iter()
            .find(|category| {
                category.is_empty() || category.contains(['/', '\\']) || category.starts_with('.')
            })
        {
            return Err(Error::InvalidInput(format!(
                "Config document has an invalid category '{bad}'"
            )));
        }
        Ok(())
    }
}

pub fn config_path(data_root: &Path) -> PathBuf {
    data_root.join(CONFIG_FILE_NAME)
}

/// Write a default document when none exists. Returns whether one was written.
pub async fn ensure_local(data_root: &Path, categories: &[String]) -> Result<bool> {
    let path = config_path(data_root);
    if tokio::fs::try_exists(&path).await? {
        return Ok(false);
    }
    tokio::fs::create_dir_all(data_root).await?;
    let document = ConfigDocument::new(data_root, categories);
    tokio::fs::write(&path, document.to_bytes()?).await?;
    tracing::info!("Created {}", path.display());
    Ok(true)
}

/// Mirror the config document in the direction `mode` allows.
///
/// Pushing modes upload first (replacing the remote copy only for
/// `local_wins` and `force_push`); pulling modes then download, validate and
/// write back. Failures are recorded, never returned.
pub async fn sync_config_document(
    blobs: &dyn BlobStore,
    data_root: &Path,
    mode: FileSyncMode,
    failures: &mut PartialFailures,
) -> FileCounts {
    let path = config_path(data_root);
    let mut counts = FileCounts::default();
    let local = match tokio::fs::read(&path).await {
        Ok(bytes) => Some(bytes),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => None,
        Err(error) => {
            failures.record_file(CONFIG_REMOTE_KEY, TransferDirection::Push, error);
            return counts;
        }
    };

    if mode.pushes() {
        if let Some(bytes) = local.clone() {
            let overwrite = matches!(
                mode,
                FileSyncMode::ForcePush | FileSyncMode::Full(ConflictPolicy::LocalWins)
            );
            match blobs.upload(CONFIG_REMOTE_KEY, bytes, overwrite).await {
                Ok(UploadOutcome::Uploaded) => counts.uploaded += 1,
                Ok(UploadOutcome::AlreadyExists) => {}
                Err(error) => {
                    failures.record_file(CONFIG_REMOTE_KEY, TransferDirection::Push, error);
                }
            }
        }
    }

    let should_pull = match mode {
        FileSyncMode::Full(_) | FileSyncMode::ForcePull => true,
        FileSyncMode::MergePull => local.is_none(),
        FileSyncMode::MergePush | FileSyncMode::ForcePush => false,
    };
    if should_pull {
        match pull_document(blobs, &path, local.as_deref()).await {
            Ok(true) => counts.downloaded += 1,
            Ok(false) => {}
            Err(error) => failures.record_file(CONFIG_REMOTE_KEY, TransferDirection::Pull, error),
        }
    }
    counts
}

/// Download and validate the remote document, writing it when it differs.
async fn pull_document(blobs: &dyn BlobStore, path: &Path, local: Option<&[u8]>) -> Result<bool> {
    let bytes = match blobs.download(CONFIG_REMOTE_KEY).await {
        Ok(bytes) => bytes,
        Err(Error::Remote(error))
            if error.status == Some(404) || error.code.as_deref() == Some("404") =>
        {
            tracing::debug!("No remote config document yet");
            return Ok(false);
        }
        Err(error) => return Err(error),
    };
    let remote = ConfigDocument::parse(&bytes)?;
    if let Some(local) = local {
        if ConfigDocument::parse(local).ok().as_ref() == Some(&remote) {
            return Ok(false);
        }
    }
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    tokio::fs::write(path, remote.to_bytes()?).await?;
    tracing::info!("Updated {} from the remote copy", path.display());
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote::memory::MemoryRemote;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn categories() -> Vec<String> {
        vec!["bills".to_string(), "expenses".to_string()]
    }

    fn document(root: &str) -> ConfigDocument {
        ConfigDocument {
            data_root: root.to_string(),
            layout_version: LAYOUT_VERSION,
            categories: categories(),
        }
    }

    #[test]
    fn parse_rejects_future_layouts_and_bad_categories() {
        let mut future = document("/data");
        future.layout_version = LAYOUT_VERSION + 1;
        assert!(ConfigDocument::parse(&future.to_bytes().unwrap()).is_err());

        let mut escaping = document("/data");
        escaping.categories = vec!["../etc".to_string()];
        assert!(ConfigDocument::parse(&escaping.to_bytes().unwrap()).is_err());

        let raw = br#"{"dataRoot":"/d","layoutVersion":1,"categories":["bills"]}"#;
        let parsed = ConfigDocument::parse(raw).unwrap();
        assert_eq!(parsed.categories, vec!["bills".to_string()]);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ensure_local_writes_once() {
        let dir = TempDir::new().unwrap();
        assert!(ensure_local(dir.path(), &categories()).await.unwrap());
        assert!(!ensure_local(dir.path(), &categories()).await.unwrap());

        let bytes = std::fs::read(config_path(dir.path())).unwrap();
        assert_eq!(ConfigDocument::parse(&bytes).unwrap().categories, categories());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_sync_converges_on_remote_copy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            config_path(dir.path()),
            document("/here").to_bytes().unwrap(),
        )
        .unwrap();
        let remote = MemoryRemote::new();
        remote.put_blob(CONFIG_REMOTE_KEY, document("/canonical").to_bytes().unwrap());

        let mut failures = PartialFailures::new();
        let counts = sync_config_document(
            &remote,
            dir.path(),
            FileSyncMode::Full(ConflictPolicy::CloudWins),
            &mut failures,
        )
        .await;

        assert!(failures.is_empty());
        assert_eq!(counts, FileCounts { uploaded: 0, downloaded: 1 });
        let bytes = std::fs::read(config_path(dir.path())).unwrap();
        let local = ConfigDocument::parse(&bytes).unwrap();
        assert_eq!(local.data_root, "/canonical");

        // converged: nothing moves the second time
        let counts = sync_config_document(
            &remote,
            dir.path(),
            FileSyncMode::Full(ConflictPolicy::CloudWins),
            &mut failures,
        )
        .await;
        assert_eq!(counts, FileCounts::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn local_wins_replaces_remote_copy() {
        let dir = TempDir::new().unwrap();
        std::fs::write(
            config_path(dir.path()),
            document("/here").to_bytes().unwrap(),
        )
        .unwrap();
        let remote = MemoryRemote::new();
        remote.put_blob(CONFIG_REMOTE_KEY, document("/elsewhere").to_bytes().unwrap());

        let mut failures = PartialFailures::new();
        let counts = sync_config_document(
            &remote,
            dir.path(),
            FileSyncMode::Full(ConflictPolicy::LocalWins),
            &mut failures,
        )
        .await;

        assert_eq!(counts, FileCounts { uploaded: 1, downloaded: 0 });
        let stored = ConfigDocument::parse(&remote.blob(CONFIG_REMOTE_KEY).unwrap()).unwrap();
        assert_eq!(stored.data_root, "/here");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalid_remote_document_is_a_partial_failure() {
        let dir = TempDir::new().unwrap();
        let remote = MemoryRemote::new();
        remote.put_blob(CONFIG_REMOTE_KEY, b"{not json".to_vec());

        let mut failures = PartialFailures::new();
        let counts =
            sync_config_document(&remote, dir.path(), FileSyncMode::ForcePull, &mut failures)
                .await;

        assert_eq!(counts, FileCounts::default());
        assert_eq!(failures.len(), 1);
        assert!(!config_path(dir.path()).exists());
    }
}
