//! Runtime configuration for the sync engine.
//!
//! Values come from the process environment (optionally seeded from `.env`
//! by the binary). The endpoint URL and credential are not part of this
//! config; they are user settings stored in the local database.

use std::env;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Error, Result};
use crate::util::normalize_text_option;

const ENV_DATA_ROOT: &str = "TALLY_DATA_ROOT";
const ENV_STORAGE_BUCKET: &str = "TALLY_STORAGE_BUCKET";
const ENV_DOCUMENT_CATEGORIES: &str = "TALLY_DOCUMENT_CATEGORIES";
const ENV_FILE_CONCURRENCY: &str = "TALLY_FILE_CONCURRENCY";
const ENV_HTTP_TIMEOUT_SECS: &str = "TALLY_HTTP_TIMEOUT_SECS";

const ENV_R2_ACCOUNT_ID: &str = "R2_ACCOUNT_ID";
const ENV_R2_BUCKET: &str = "R2_BUCKET";
const ENV_R2_ACCESS_KEY_ID: &str = "R2_ACCESS_KEY_ID";
const ENV_R2_SECRET_ACCESS_KEY: &str = "R2_SECRET_ACCESS_KEY";

const DEFAULT_STORAGE_BUCKET: &str = "documents";
const DEFAULT_DOCUMENT_CATEGORIES: [&str; 2] = ["bills", "expenses"];
const DEFAULT_FILE_CONCURRENCY: usize = 4;
const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 30;

/// Cloudflare R2 credentials used instead of Supabase Storage for documents.
#[derive(Clone, PartialEq, Eq)]
pub struct R2Config {
    pub account_id: String,
    pub bucket: String,
    pub access_key_id: String,
    pub secret_access_key: String,
}

impl R2Config {
    /// Cloudflare R2 S3-compatible endpoint URL.
    #[must_use]
    pub fn endpoint_url(&self) -> String {
        format!("https://{}.r2.cloudflarestorage.com", self.account_id)
    }
}

impl fmt::Debug for R2Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("R2Config")
            .field("account_id", &self.account_id)
            .field("bucket", &self.bucket)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"[REDACTED]")
            .finish()
    }
}

/// Engine settings that are deployment concerns rather than user settings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncRuntimeConfig {
    /// Root of the document tree; file sync is skipped when unset.
    pub data_root: Option<PathBuf>,
    /// Supabase Storage bucket holding documents.
    pub storage_bucket: String,
    /// Subdirectories of the data root mirrored as blob prefixes.
    pub document_categories: Vec<String>,
    /// Upper bound on concurrent file transfers.
    pub file_concurrency: usize,
    pub http_timeout: Duration,
    pub r2: Option<R2Config>,
}

impl Default for SyncRuntimeConfig {
    fn default() -> Self {
        Self {
            data_root: None,
            storage_bucket: DEFAULT_STORAGE_BUCKET.to_string(),
            document_categories: DEFAULT_DOCUMENT_CATEGORIES
                .iter()
                .map(|category| (*category).to_string())
                .collect(),
            file_concurrency: DEFAULT_FILE_CONCURRENCY,
            http_timeout: Duration::from_secs(DEFAULT_HTTP_TIMEOUT_SECS),
            r2: None,
        }
    }
}

impl SyncRuntimeConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        parse_config(|key| env::var(key).ok())
    }

    #[must_use]
    pub fn with_data_root(mut self, data_root: impl Into<PathBuf>) -> Self {
        self.data_root = Some(data_root.into());
        self
    }
}

fn parse_config(lookup: impl Fn(&str) -> Option<String>) -> Result<SyncRuntimeConfig> {
    let defaults = SyncRuntimeConfig::default();

    let data_root = normalize_text_option(lookup(ENV_DATA_ROOT)).map(PathBuf::from);
    let storage_bucket =
        normalize_text_option(lookup(ENV_STORAGE_BUCKET)).unwrap_or(defaults.storage_bucket);

    let document_categories = match normalize_text_option(lookup(ENV_DOCUMENT_CATEGORIES)) {
        Some(value) => value
            .split(',')
            .map(|category| category.trim().trim_matches('/').to_string())
            .filter(|category| !category.is_empty())
            .collect(),
        None => defaults.document_categories,
    };

    let file_concurrency = match normalize_text_option(lookup(ENV_FILE_CONCURRENCY)) {
        Some(value) => match value.parse::<usize>() {
            Ok(limit) if limit > 0 => limit,
            _ => {
                return Err(Error::InvalidInput(format!(
                    "{ENV_FILE_CONCURRENCY} must be a positive integer, got '{value}'"
                )))
            }
        },
        None => defaults.file_concurrency,
    };

    let http_timeout = match normalize_text_option(lookup(ENV_HTTP_TIMEOUT_SECS)) {
        Some(value) => value.parse::<u64>().map(Duration::from_secs).map_err(|_| {
            Error::InvalidInput(format!(
                "{ENV_HTTP_TIMEOUT_SECS} must be a whole number of seconds, got '{value}'"
            ))
        })?,
        None => defaults.http_timeout,
    };

    Ok(SyncRuntimeConfig {
        data_root,
        storage_bucket,
        document_categories,
        file_concurrency,
        http_timeout,
        r2: parse_r2(&lookup)?,
    })
}

fn parse_r2(lookup: &impl Fn(&str) -> Option<String>) -> Result<Option<R2Config>> {
    let account_id = normalize_text_option(lookup(ENV_R2_ACCOUNT_ID));
    let bucket = normalize_text_option(lookup(ENV_R2_BUCKET));
    let access_key_id = normalize_text_option(lookup(ENV_R2_ACCESS_KEY_ID));
    let secret_access_key = normalize_text_option(lookup(ENV_R2_SECRET_ACCESS_KEY));

    match (account_id, bucket, access_key_id, secret_access_key) {
        (None, None, None, None) => Ok(None),
        (Some(account_id), Some(bucket), Some(access_key_id), Some(secret_access_key)) => {
            Ok(Some(R2Config {
                account_id,
                bucket,
                access_key_id,
                secret_access_key,
            }))
        }
        (account_id, bucket, access_key_id, secret_access_key) => {
            let missing = [
                (ENV_R2_ACCOUNT_ID, account_id.is_none()),
                (ENV_R2_BUCKET, bucket.is_none()),
                (ENV_R2_ACCESS_KEY_ID, access_key_id.is_none()),
                (ENV_R2_SECRET_ACCESS_KEY, secret_access_key.is_none()),
            ]
            .into_iter()
            .filter_map(|(name, is_missing)| is_missing.then_some(name))
            .collect::<Vec<_>>();
            Err(Error::InvalidInput(format!(
                "R2 configuration is incomplete. Missing: {}",
                missing.join(", ")
            )))
        }
    }
}
