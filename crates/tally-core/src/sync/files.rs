//! Document tree reconciliation between a local directory and a blob prefix.
//!
//! Files are identified by their `/`-separated path relative to the
//! category root. Plans are set differences of the two path lists; content
//! is never compared.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use futures::{stream, StreamExt};
use walkdir::WalkDir;

use crate::error::{Error, Result};
use crate::models::{ConflictPolicy, FileManifestEntry, SyncStrategy, TransferDirection};
use crate::remote::{BlobStore, UploadOutcome};

use super::partial::PartialFailures;

/// Files moved by one reconciliation step.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FileCounts {
    pub uploaded: u64,
    pub downloaded: u64,
}

impl std::ops::AddAssign for FileCounts {
    fn add_assign(&mut self, other: Self) {
        self.uploaded += other.uploaded;
        self.downloaded += other.downloaded;
    }
}

/// How a file sync treats each side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSyncMode {
    Full(ConflictPolicy),
    MergePull,
    MergePush,
    ForcePull,
    ForcePush,
}

impl FileSyncMode {
    pub const fn new(strategy: SyncStrategy, policy: ConflictPolicy) -> Self {
        match strategy {
            SyncStrategy::Full => Self::Full(policy),
            SyncStrategy::MergePull => Self::MergePull,
            SyncStrategy::MergePush => Self::MergePush,
            SyncStrategy::ForcePull => Self::ForcePull,
            SyncStrategy::ForcePush => Self::ForcePush,
        }
    }

    pub const fn pushes(self) -> bool {
        matches!(self, Self::Full(_) | Self::MergePush | Self::ForcePush)
    }
}

/// Transfers needed to reconcile `local` with `remote`, sorted by path.
pub fn plan_transfers(
    local: &BTreeSet<String>,
    remote: &BTreeSet<String>,
    mode: FileSyncMode,
) -> Vec<FileManifestEntry> {
    let upload = |path: &String, overwrite| FileManifestEntry {
        relative_path: path.clone(),
        direction: TransferDirection::Push,
        overwrite,
    };
    let download = |path: &String, overwrite| FileManifestEntry {
        relative_path: path.clone(),
        direction: TransferDirection::Pull,
        overwrite,
    };

    let mut plan = match mode {
        FileSyncMode::Full(policy) => {
            let mut plan = local
                .difference(remote)
                .map(|path| upload(path, false))
                .chain(remote.difference(local).map(|path| download(path, false)))
                .collect::<Vec<_>>();
            if policy == ConflictPolicy::LocalWins {
                plan.extend(local.intersection(remote).map(|path| upload(path, true)));
            }
            plan
        }
        FileSyncMode::MergePull => remote
            .difference(local)
            .map(|path| download(path, false))
            .collect(),
        FileSyncMode::MergePush => local
            .difference(remote)
            .map(|path| upload(path, false))
            .collect(),
        FileSyncMode::ForcePull => remote.iter().map(|path| download(path, true)).collect(),
        FileSyncMode::ForcePush => local.iter().map(|path| upload(path, true)).collect(),
    };
    plan.sort_by(|left, right| left.relative_path.cmp(&right.relative_path));
    plan
}

/// Moves files between one local directory and one blob prefix.
pub struct FileReconciler<'a> {
    blobs: &'a dyn BlobStore,
    concurrency: usize,
}

impl<'a> FileReconciler<'a> {
    pub fn new(blobs: &'a dyn BlobStore, concurrency: usize) -> Self {
        Self {
            blobs,
            concurrency: concurrency.max(1),
        }
    }

    /// Reconcile `local_root` with `remote_prefix`.
    ///
    /// A failed remote listing aborts. Unreadable local entries and failed
    /// transfers are recorded in `failures` and the rest continue.
    pub async fn sync_files(
        &self,
        local_root: &Path,
        remote_prefix: &str,
        mode: FileSyncMode,
        failures: &mut PartialFailures,
    ) -> Result<FileCounts> {
        let remote_prefix = remote_prefix.trim().trim_matches('/');
        let (listing, remote) = tokio::try_join!(
            list_local_files(local_root),
            self.list_remote_files(remote_prefix)
        )?;
        let direction = if mode.pushes() {
            TransferDirection::Push
        } else {
            TransferDirection::Pull
        };
        for (relative, error) in listing.unreadable {
            failures.record_file(remote_key(remote_prefix, &relative), direction, error);
        }
        let local = listing.files;
        let plan = plan_transfers(&local, &remote, mode);
        tracing::debug!(
            "File sync of {remote_prefix}: {} local, {} remote, {} planned",
            local.len(),
            remote.len(),
            plan.len()
        );

        let outcomes = stream::iter(plan)
            .map(|entry| async move {
                let outcome = self.transfer(local_root, remote_prefix, &entry).await;
                (entry, outcome)
            })
            .buffer_unordered(self.concurrency)
            .collect::<Vec<_>>()
            .await;

        let mut counts = FileCounts::default();
        for (entry, outcome) in outcomes {
            match outcome {
                Ok(false) => {}
                Ok(true) => match entry.direction {
                    TransferDirection::Push => counts.uploaded += 1,
                    TransferDirection::Pull => counts.downloaded += 1,
                },
                Err(error) => failures.record_file(
                    remote_key(remote_prefix, &entry.relative_path),
                    entry.direction,
                    error,
                ),
            }
        }
        Ok(counts)
    }

    /// Every object below `prefix`, as paths relative to it.
    pub async fn list_remote_files(&self, prefix: &str) -> Result<BTreeSet<String>> {
        let mut files = BTreeSet::new();
        let mut pending = vec![String::new()];
        while let Some(relative_dir) = pending.pop() {
            let listing = remote_key(prefix, &relative_dir);
            for entry in self.blobs.list(&listing).await? {
                if !is_safe_segment(&entry.name) {
                    tracing::warn!("Ignoring remote entry '{}' under {listing}", entry.name);
                    continue;
                }
                let relative = if relative_dir.is_empty() {
                    entry.name
                } else {
                    format!("{relative_dir}/{}", entry.name)
                };
                if entry.is_container {
                    pending.push(relative);
                } else {
                    files.insert(relative);
                }
            }
        }
        Ok(files)
    }

    /// Returns whether anything was transferred.
    async fn transfer(
        &self,
        local_root: &Path,
        remote_prefix: &str,
        entry: &FileManifestEntry,
    ) -> Result<bool> {
        let key = remote_key(remote_prefix, &entry.relative_path);
        let local_path = local_path(local_root, &entry.relative_path)?;
        match entry.direction {
            TransferDirection::Push => {
                let bytes = tokio::fs::read(&local_path).await?;
                let outcome = self.blobs.upload(&key, bytes, entry.overwrite).await?;
                Ok(outcome == UploadOutcome::Uploaded)
            }
            TransferDirection::Pull => {
                if !entry.overwrite && tokio::fs::try_exists(&local_path).await? {
                    return Ok(false);
                }
                let bytes = self.blobs.download(&key).await?;
                if let Some(parent) = local_path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&local_path, bytes).await?;
                Ok(true)
            }
        }
    }
}

/// Result of walking a local document tree.
#[derive(Debug, Default)]
pub struct LocalListing {
    /// Regular files as `/`-separated paths relative to the root.
    pub files: BTreeSet<String>,
    /// Entries the walk could not read, with the reason.
    pub unreadable: Vec<(String, String)>,
}

/// Every regular file below `root`. A missing root is an empty tree; an
/// unreadable entry is reported and the walk continues past it.
pub async fn list_local_files(root: &Path) -> Result<LocalListing> {
    let root = root.to_path_buf();
    tokio::task::spawn_blocking(move || walk_local_files(&root))
        .await
        .map_err(|error| Error::Io(std::io::Error::other(error)))
}

fn walk_local_files(root: &Path) -> LocalListing {
    let mut listing = LocalListing::default();
    if !root.exists() {
        return listing;
    }

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(error) => {
                let relative = error
                    .path()
                    .and_then(|path| path.strip_prefix(root).ok())
                    .map(relative_string)
                    .unwrap_or_default();
                listing.unreadable.push((relative, error.to_string()));
                continue;
            }
        };
        if !entry.file_type().is_file() {
            continue;
        }
        if let Ok(relative) = entry.path().strip_prefix(root) {
            listing.files.insert(relative_string(relative));
        }
    }
    listing
}

fn relative_string(relative: &Path) -> String {
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

fn remote_key(prefix: &str, relative: &str) -> String {
    match (prefix.is_empty(), relative.is_empty()) {
        (true, _) => relative.to_string(),
        (false, true) => prefix.to_string(),
        (false, false) => format!("{prefix}/{relative}"),
    }
}

fn is_safe_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Local path for a relative path, refusing anything that escapes the root.
fn local_path(root: &Path, relative: &str) -> Result<PathBuf> {
    let mut path = root.to_path_buf();
    for segment in relative.split('/') {
        if !is_safe_segment(segment) {
            return Err(Error::InvalidInput(format!(
                "Refusing unsafe document path '{relative}'"
            )));
        }
        path.push(segment);
    }
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::FailureTarget;
    use crate::remote::memory::MemoryRemote;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn paths(items: &[&str]) -> BTreeSet<String> {
        items.iter().map(ToString::to_string).collect()
    }

    fn summary(plan: &[FileManifestEntry]) -> Vec<(&str, TransferDirection, bool)> {
        plan.iter()
            .map(|entry| (entry.relative_path.as_str(), entry.direction, entry.overwrite))
            .collect()
    }

    fn write(root: &Path, relative: &str, contents: &str) {
        let path = root.join(relative);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, contents).unwrap();
    }

    #[test]
    fn full_plan_follows_conflict_policy() {
        let local = paths(&["a", "b"]);
        let remote = paths(&["b", "c"]);
        use TransferDirection::{Pull, Push};

        assert_eq!(
            summary(&plan_transfers(
                &local,
                &remote,
                FileSyncMode::Full(ConflictPolicy::CloudWins)
            )),
            vec![("a", Push, false), ("c", Pull, false)]
        );
        assert_eq!(
            summary(&plan_transfers(
                &local,
                &remote,
                FileSyncMode::Full(ConflictPolicy::LocalWins)
            )),
            vec![("a", Push, false), ("b", Push, true), ("c", Pull, false)]
        );
    }

    #[test]
    fn one_way_plans() {
        let local = paths(&["a", "b"]);
        let remote = paths(&["b", "c"]);
        use TransferDirection::{Pull, Push};

        assert_eq!(
            summary(&plan_transfers(&local, &remote, FileSyncMode::MergePull)),
            vec![("c", Pull, false)]
        );
        assert_eq!(
            summary(&plan_transfers(&local, &remote, FileSyncMode::MergePush)),
            vec![("a", Push, false)]
        );
        assert_eq!(
            summary(&plan_transfers(&local, &remote, FileSyncMode::ForcePull)),
            vec![("b", Pull, true), ("c", Pull, true)]
        );
        assert_eq!(
            summary(&plan_transfers(&local, &remote, FileSyncMode::ForcePush)),
            vec![("a", Push, true), ("b", Push, true)]
        );
    }

    #[test]
    fn local_path_rejects_traversal() {
        let root = Path::new("/data/bills");
        assert_eq!(
            local_path(root, "2024/a.pdf").unwrap(),
            root.join("2024").join("a.pdf")
        );
        assert!(local_path(root, "../secrets").is_err());
        assert!(local_path(root, "a//b").is_err());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn missing_local_root_is_empty() {
        let dir = TempDir::new().unwrap();
        let listing = list_local_files(&dir.path().join("nope")).await.unwrap();
        assert!(listing.files.is_empty());
        assert!(listing.unreadable.is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn sync_uploads_and_downloads_nested_files() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "2024/a.pdf", "a");
        write(dir.path(), "b.pdf", "local b");
        let remote = MemoryRemote::new();
        remote.put_blob("bills/b.pdf", b"remote b".to_vec());
        remote.put_blob("bills/2023/c.pdf", b"c".to_vec());

        let mut failures = PartialFailures::new();
        let counts = FileReconciler::new(&remote, 2)
            .sync_files(
                dir.path(),
                "bills",
                FileSyncMode::Full(ConflictPolicy::CloudWins),
                &mut failures,
            )
            .await
            .unwrap();

        assert_eq!(counts, FileCounts { uploaded: 1, downloaded: 1 });
        assert!(failures.is_empty());
        assert_eq!(remote.blob("bills/2024/a.pdf").unwrap(), b"a");
        assert_eq!(remote.blob("bills/b.pdf").unwrap(), b"remote b");
        assert_eq!(
            std::fs::read_to_string(dir.path().join("2023/c.pdf")).unwrap(),
            "c"
        );
        assert_eq!(
            std::fs::read_to_string(dir.path().join("b.pdf")).unwrap(),
            "local b"
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn failed_transfer_does_not_stop_others() {
        let dir = TempDir::new().unwrap();
        for name in ["a.pdf", "b.pdf", "c.pdf"] {
            write(dir.path(), name, name);
        }
        let remote = MemoryRemote::new();
        remote.fail_upload("expenses/b.pdf");

        let mut failures = PartialFailures::new();
        let counts = FileReconciler::new(&remote, 4)
            .sync_files(dir.path(), "expenses", FileSyncMode::MergePush, &mut failures)
            .await
            .unwrap();

        assert_eq!(counts.uploaded, 2);
        let failures = failures.into_vec();
        assert_eq!(failures.len(), 1);
        assert_eq!(
            failures[0].target,
            FailureTarget::File {
                path: "expenses/b.pdf".to_string()
            }
        );
        assert_eq!(remote.blob_keys(), vec!["expenses/a.pdf", "expenses/c.pdf"]);
    }

    #[cfg(unix)]
    #[tokio::test(flavor = "multi_thread")]
    async fn unreadable_directory_does_not_stop_the_walk() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        write(dir.path(), "a.pdf", "a");
        write(dir.path(), "locked/x.pdf", "x");
        let locked = dir.path().join("locked");
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o000)).unwrap();
        // root ignores directory permissions
        let enforced = std::fs::read_dir(&locked).is_err();

        let remote = MemoryRemote::new();
        let mut failures = PartialFailures::new();
        let result = FileReconciler::new(&remote, 2)
            .sync_files(dir.path(), "bills", FileSyncMode::MergePush, &mut failures)
            .await;
        std::fs::set_permissions(&locked, std::fs::Permissions::from_mode(0o755)).unwrap();

        let counts = result.unwrap();
        assert_eq!(remote.blob("bills/a.pdf").unwrap(), b"a");
        if enforced {
            assert_eq!(counts.uploaded, 1);
            let failures = failures.into_vec();
            assert_eq!(failures.len(), 1);
            assert_eq!(
                failures[0].target,
                FailureTarget::File {
                    path: "bills/locked".to_string()
                }
            );
            assert_eq!(failures[0].direction, TransferDirection::Push);
        } else {
            assert_eq!(counts.uploaded, 2);
            assert!(failures.is_empty());
        }
    }
}
