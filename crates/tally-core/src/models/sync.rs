//! Sync strategy, policy and result models

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

use super::table::SyncTable;

/// Which side keeps its value when both hold a record with differing
/// `updated_at`. Only consulted by the `full` strategy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    #[default]
    CloudWins,
    LocalWins,
}

impl ConflictPolicy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::CloudWins => "cloud_wins",
            Self::LocalWins => "local_wins",
        }
    }
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ConflictPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().replace('-', "_").as_str() {
            "cloud_wins" | "cloud" => Ok(Self::CloudWins),
            "local_wins" | "local" => Ok(Self::LocalWins),
            other => Err(Error::InvalidInput(format!(
                "Unknown conflict policy '{other}' (expected cloud_wins or local_wins)"
            ))),
        }
    }
}

/// How a sync run reconciles the two sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncStrategy {
    /// Both directions, conflicts decided by [`ConflictPolicy`].
    Full,
    /// Copy remote-only records locally; never overwrites.
    MergePull,
    /// Copy local-only records remotely; never overwrites.
    MergePush,
    /// Replace local tables with the remote snapshot.
    ForcePull,
    /// Replace remote tables with the local snapshot. Needs an elevated credential.
    ForcePush,
}

impl SyncStrategy {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Full => "full",
            Self::MergePull => "merge_pull",
            Self::MergePush => "merge_push",
            Self::ForcePull => "force_pull",
            Self::ForcePush => "force_push",
        }
    }
}

impl fmt::Display for SyncStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Direction of a single row or file transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferDirection {
    /// Local to remote.
    Push,
    /// Remote to local.
    Pull,
}

/// One planned file transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileManifestEntry {
    pub relative_path: String,
    pub direction: TransferDirection,
    /// Uploads replace an existing object; downloads replace an existing file.
    pub overwrite: bool,
}

/// What failed to transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum FailureTarget {
    Row { table: SyncTable, id: String },
    File { path: String },
}

/// A row or file that failed to transfer. Absorbed into the run result
/// instead of aborting it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartialFailure {
    pub target: FailureTarget,
    pub direction: TransferDirection,
    pub message: String,
}

/// Aggregated outcome of one sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResult {
    pub pushed: u64,
    pub pulled: u64,
    pub files_uploaded: u64,
    pub files_downloaded: u64,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failures: Vec<PartialFailure>,
}

impl SyncResult {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }
}

/// Sync status reported to callers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatus {
    pub configured: bool,
    pub enabled: bool,
    pub conflict_policy: ConflictPolicy,
    pub last_sync_at: Option<String>,
    pub realtime: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conflict_policy_parses_cli_spellings() {
        assert_eq!(
            "cloud-wins".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::CloudWins
        );
        assert_eq!(
            "LOCAL_WINS".parse::<ConflictPolicy>().unwrap(),
            ConflictPolicy::LocalWins
        );
        assert!("newest".parse::<ConflictPolicy>().is_err());
    }

    #[test]
    fn conflict_policy_defaults_to_cloud_wins() {
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::CloudWins);
        assert_eq!(
            serde_json::to_string(&ConflictPolicy::LocalWins).unwrap(),
            "\"local_wins\""
        );
    }

    #[test]
    fn sync_result_serializes_camel_case_counters() {
        let result = SyncResult {
            pushed: 1,
            pulled: 2,
            files_uploaded: 3,
            files_downloaded: 4,
            failures: Vec::new(),
        };
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["filesUploaded"], 3);
        assert_eq!(json["filesDownloaded"], 4);
        assert!(json.get("failures").is_none());
    }

    #[test]
    fn partial_failure_serializes_target_kind() {
        let failure = PartialFailure {
            target: FailureTarget::Row {
                table: SyncTable::Invoice,
                id: "inv-1".to_string(),
            },
            direction: TransferDirection::Push,
            message: "boom".to_string(),
        };
        let json = serde_json::to_value(&failure).unwrap();
        assert_eq!(json["target"]["kind"], "row");
        assert_eq!(json["target"]["table"], "invoice");
        assert_eq!(json["direction"], "push");
    }
}
