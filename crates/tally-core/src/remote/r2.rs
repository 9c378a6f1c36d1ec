//! Cloudflare R2 document storage over the S3 API.

use async_trait::async_trait;
use aws_credential_types::Credentials;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::{primitives::ByteStream, Client};
use aws_types::region::Region;

use crate::config::R2Config;
use crate::error::{Error, RemoteError, Result};

use super::{BlobEntry, BlobStore, UploadOutcome};

const DELIMITER: &str = "/";

/// R2 implementation of [`BlobStore`].
#[derive(Clone, Debug)]
pub struct R2BlobStore {
    bucket: String,
    client: Client,
}

impl R2BlobStore {
    #[must_use]
    pub fn new(config: &R2Config) -> Self {
        Self {
            bucket: config.bucket.clone(),
            client: build_s3_client(config),
        }
    }

    async fn exists(&self, object_key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(object_key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(error) => {
                let service_error = error.into_service_error();
                if service_error.is_not_found() {
                    Ok(false)
                } else {
                    Err(storage_error(
                        "head_object",
                        &self.bucket,
                        Some(object_key),
                        service_error,
                    ))
                }
            }
        }
    }
}

#[async_trait]
impl BlobStore for R2BlobStore {
    async fn list(&self, prefix: &str) -> Result<Vec<BlobEntry>> {
        let prefix = prefix.trim().trim_matches('/');
        let prefix = if prefix.is_empty() {
            String::new()
        } else {
            format!("{prefix}{DELIMITER}")
        };

        let mut entries = Vec::new();
        let mut continuation: Option<String> = None;
        loop {
            let response = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(&prefix)
                .delimiter(DELIMITER)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|error| {
                    storage_error("list_objects_v2", &self.bucket, Some(&prefix), error)
                })?;

            entries.extend(
                response
                    .common_prefixes()
                    .iter()
                    .filter_map(|common| common.prefix())
                    .filter_map(|full| relative_name(&prefix, full))
                    .map(BlobEntry::container),
            );
            entries.extend(
                response
                    .contents()
                    .iter()
                    .filter_map(|object| object.key())
                    .filter_map(|full| relative_name(&prefix, full))
                    .map(BlobEntry::object),
            );

            match response.next_continuation_token() {
                Some(token) if response.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }
        Ok(entries)
    }

    async fn upload(&self, key: &str, bytes: Vec<u8>, overwrite: bool) -> Result<UploadOutcome> {
        let object_key = normalize_object_key(key)?;
        // S3 has no create-if-absent put; check first
        if !overwrite && self.exists(&object_key).await? {
            return Ok(UploadOutcome::AlreadyExists);
        }

        let content_type = mime_guess::from_path(&object_key).first_or_octet_stream();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .content_type(content_type.essence_str())
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|error| storage_error("put_object", &self.bucket, Some(&object_key), error))?;
        Ok(UploadOutcome::Uploaded)
    }

    async fn download(&self, key: &str) -> Result<Vec<u8>> {
        let object_key = normalize_object_key(key)?;
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(&object_key)
            .send()
            .await
            .map_err(|error| {
                get_object_error(&self.bucket, &object_key, error.into_service_error())
            })?;

        let payload = response.body.collect().await.map_err(|error| {
            storage_error("get_object_body", &self.bucket, Some(&object_key), error)
        })?;
        Ok(payload.into_bytes().to_vec())
    }
}

fn build_s3_client(config: &R2Config) -> Client {
    let credentials = Credentials::new(
        config.access_key_id.clone(),
        config.secret_access_key.clone(),
        None,
        None,
        "tally-core-r2-storage",
    );

    let sdk_config = aws_sdk_s3::config::Builder::new()
        .region(Region::new("auto"))
        .credentials_provider(credentials)
        .endpoint_url(config.endpoint_url())
        .force_path_style(true)
        .build();

    Client::from_conf(sdk_config)
}

/// Last path component of `full` below `prefix`, without trailing slash.
fn relative_name(prefix: &str, full: &str) -> Option<String> {
    let name = full.strip_prefix(prefix)?.trim_end_matches('/');
    if name.is_empty() || name.contains('/') {
        return None;
    }
    Some(name.to_string())
}

fn storage_error(
    operation: &str,
    bucket: &str,
    object_key: Option<&str>,
    error: impl std::fmt::Display,
) -> Error {
    let target = object_key.map_or_else(|| bucket.to_string(), |key| format!("{bucket}/{key}"));
    RemoteError::new(format!("R2 {operation} {target}"), error.to_string()).into()
}

/// A missing object reports HTTP 404 like the Storage API does.
fn get_object_error(bucket: &str, object_key: &str, error: GetObjectError) -> Error {
    if error.is_no_such_key() {
        let target = format!("{bucket}/{object_key}");
        return RemoteError::new(format!("R2 get_object {target}"), error.to_string())
            .with_status(404)
            .with_code("NoSuchKey")
            .into();
    }
    storage_error("get_object", bucket, Some(object_key), error)
}

fn normalize_object_key(object_key: &str) -> Result<String> {
    let object_key = object_key.trim().trim_matches('/').to_string();
    if object_key.is_empty() {
        return Err(Error::InvalidInput(
            "Storage object key cannot be empty".to_string(),
        ));
    }
    Ok(object_key)
}
