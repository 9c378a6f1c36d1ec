//! Supabase Storage client for the document bucket.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::json;
use url::Url;

use crate::error::{Error, RemoteError, Result};
use crate::util::compact_text;
use crate::vault::SecretString;

use super::{transport_error, BlobEntry, BlobStore, UploadOutcome};

const LIST_PAGE_SIZE: usize = 1000;

/// Supabase Storage implementation of [`BlobStore`].
#[derive(Clone)]
pub struct SupabaseStorage {
    client: reqwest::Client,
    storage_url: Url,
    bucket: String,
    api_key: SecretString,
}

impl std::fmt::Debug for SupabaseStorage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SupabaseStorage")
            .field("storage_url", &self.storage_url.as_str())
            .field("bucket", &self.bucket)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

#[derive(Debug, Deserialize)]
struct ListedObject {
    name: String,
    /// Folders are reported without an object id.
    #[serde(default)]
    id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct StorageErrorResponse {
    #[serde(default, rename = "statusCode")]
    status_code: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

impl SupabaseStorage {
    pub fn new(
        base_url: &str,
        bucket: impl Into<String>,
        api_key: SecretString,
        timeout: Duration,
    ) -> Result<Self> {
        let storage_url = Url::parse(&format!(
            "{}/storage/v1/",
            base_url.trim().trim_end_matches('/')
        ))
        .map_err(|error| Error::InvalidInput(format!("Invalid storage URL: {error}")))?;
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| transport_error("build http client", &error))?;
        Ok(Self {
            client,
            storage_url,
            bucket: bucket.into(),
            api_key,
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", self.api_key.expose())
            .bearer_auth(self.api_key.expose())
    }

    /// `<storage>/object/<bucket>/<key segments...>` with each segment escaped.
    fn object_url(&self, key: &str) -> Result<Url> {
        let key = normalize_object_key(key)?;
        let mut url = self.storage_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidInput("Storage URL cannot be a base".to_string()))?
            .pop_if_empty()
            .push("object")
            .push(&self.bucket)
            .extend(key.split('/'));
        Ok(url)
    }

    fn list_url(&self) -> Result<Url> {
        let mut url = self.storage_url.clone();
        url.path_segments_mut()
            .map_err(|()| Error::InvalidInput("Storage URL cannot be a base".to_string()))?
            .pop_if_empty()
            .extend(["object", "list", self.bucket.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl BlobStore for SupabaseStorage {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let operation = format!("list {}/{prefix}", self.bucket);
        let prefix = prefix.trim().trim_matches('/');
        let mut entries = Vec::new();
        let mut offset = 0usize;
        loop {
            let request = self.request(self.client.post(self.list_url()?).json(&json!({
                "prefix": prefix,
                "limit": LIST_PAGE_SIZE,
                "offset": offset,
                "sortBy": { "column": "name", "order": "asc" },
            })));
            let response = send(&operation, request).await?;
            let page = response
                .json::<Vec<ListedObject>>()
                .await
                .map_err(|error| transport_error(&operation, &error))?;
            let fetched = page.len();
            entries.extend(
                page.into_iter()
                    // Supabase keeps empty folders alive with a placeholder object
                    .filter(|object| object.name != ".emptyFolderPlaceholder")
                    .map(|object| BlobEntry {
                        is_container: object.id.is_none(),
                        name: object.name,
                    }),
            );
            if fetched < LIST_PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        Ok(entries)
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<UploadOutcome> {
        let operation = format!("upload {}/{key}", self.bucket);
        let content_type = mime_guess::from_path(key).first_or_octet_stream();
        let request = self.request(
            self.client
                .post(self.object_url(key)?)
                .header("x-upsert", if overwrite { "true" } else { "false" })
                .header("Content-Type", content_type.essence_str())
                .body(bytes),
        );

        let response = request
            .send()
            .await
            .map_err(|error| transport_error(&operation, &error))?;
        if response.status().is_success() {
            return Ok(UploadOutcome::Uploaded);
        }
        let status = response.status();
        let body = response.text().await.unwrap_or_default();
        let error = parse_storage_error(&operation, status, &body);
        if !overwrite && is_duplicate(&error) {
            return Ok(UploadOutcome::AlreadyExists);
        }
        Err(error.into())
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let operation = format!("download {}/{key}", self.bucket);
        let request = self.request(self.client.get(self.object_url(key)?));
        let response = send(&operation, request).await?;
        let bytes = response
            .bytes()
            .await
            .map_err(|error| transport_error(&operation, &error))?;
        Ok(bytes.to_vec())
    }
}

async fn send(operation: &str, request: RequestBuilder) -> Result<Response> {
    let response = request
        .send()
        .await
        .map_err(|error| transport_error(operation, &error))?;
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    Err(parse_storage_error(operation, status, &body).into())
}

fn parse_storage_error(operation: &str, status: StatusCode, body: &str) -> RemoteError {
    let mut error = RemoteError::new(operation, compact_text(body)).with_status(status.as_u16());
    if let Ok(payload) = serde_json::from_str::<StorageErrorResponse>(body) {
        if let Some(message) = payload.message.or_else(|| payload.error.clone()) {
            error.message = message.trim().to_string();
        }
        // Storage nests the logical status inside a 400 response
        if let Some(code) = payload.status_code.or(payload.error) {
            error = error.with_code(code);
        }
    }
    if error.message.is_empty() {
        error.message = format!("HTTP {}", status.as_u16());
    }
    error
}

fn is_duplicate(error: &RemoteError) -> bool {
    error.status == Some(409)
        || matches!(error.code.as_deref(), Some("409" | "Duplicate"))
        || error.message.to_ascii_lowercase().contains("already exists")
}

fn normalize_object_key(key: &str) -> Result<String> {
    let key = key.trim().trim_matches('/').to_string();
    if key.is_empty() {
        return Err(Error::InvalidInput(
            "Storage object key cannot be empty".to_string(),
        ));
    }
    Ok(key)
}
