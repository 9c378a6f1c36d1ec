//! Supabase PostgREST client for the remote record tables.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{RemoteError, Result};
use crate::models::{row_id, Row, SyncTable};
use crate::util::compact_text;
use crate::vault::SecretString;

use super::{transport_error, RemoteTables};

/// Rows per page on full-table reads.
const PAGE_SIZE: usize = 1000;
/// Ids per `in.(...)` filter, bounded by URL length.
const ID_FILTER_CHUNK: usize = 100;
/// Rows per bulk insert request.
const INSERT_CHUNK: usize = 500;

/// PostgREST implementation of [`RemoteTables`].
#[derive(Clone)]
pub struct PostgrestTables {
    client: reqwest::Client,
    rest_url: String,
    api_key: SecretString,
}

impl std::fmt::Debug for PostgrestTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostgrestTables")
            .field("rest_url", &self.rest_url)
            .field("api_key", &"[REDACTED]")
            .finish()
    }
}

impl PostgrestTables {
    /// Client for the project at `base_url` (e.g. `https://abc.supabase.co`).
    pub fn new(base_url: &str, api_key: SecretString, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|error| transport_error("build http client", &error))?;
        Ok(Self {
            client,
            rest_url: format!("{}/rest/v1", base_url.trim().trim_end_matches('/')),
            api_key,
        })
    }

    fn request(&self, builder: RequestBuilder) -> RequestBuilder {
        builder
            .header("apikey", self.api_key.expose())
            .bearer_auth(self.api_key.expose())
            .header("Accept", "application/json")
    }

    fn table_url(&self, table: SyncTable) -> String {
        format!("{}/{}", self.rest_url, table.name())
    }

    async fn select_paged(&self, table: SyncTable, columns: &str) -> Result<Vec<Row>> {
        let operation = format!("select {table}");
        let mut rows = Vec::new();
        let mut offset = 0usize;
        loop {
            let request = self.request(self.client.get(self.table_url(table)).query(&[
                ("select", columns.to_string()),
                ("order", "id.asc".to_string()),
                ("limit", PAGE_SIZE.to_string()),
                ("offset", offset.to_string()),
            ]));
            let page = send_rows(&operation, request).await?;
            let fetched = page.len();
            rows.extend(page);
            if fetched < PAGE_SIZE {
                break;
            }
            offset += fetched;
        }
        tracing::debug!("Fetched {} remote {table} rows", rows.len());
        Ok(rows)
    }
}

#[async_trait]
impl RemoteTables for PostgrestTables {
    async fn select_all(&self, table: SyncTable) -> Result<Vec<Row>> {
        self.select_paged(table, "*").await
    }

    async fn select_ids(&self, table: SyncTable) -> Result<Vec<String>> {
        let rows = self.select_paged(table, "id").await?;
        Ok(rows.iter().filter_map(row_id).collect())
    }

    async fn select_by_ids(&self, table: SyncTable, ids: &[String]) -> Result<Vec<Row>> {
        let operation = format!("select {table} by id");
        let mut rows = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_FILTER_CHUNK) {
            let request = self.request(
                self.client
                    .get(self.table_url(table))
                    .query(&[("select", "*".to_string()), ("id", in_filter(chunk))]),
            );
            rows.extend(send_rows(&operation, request).await?);
        }
        Ok(rows)
    }

    async fn insert(&self, table: SyncTable, rows: &[Row]) -> Result<()> {
        let operation = format!("insert {table}");
        for chunk in rows.chunks(INSERT_CHUNK) {
            let request = self.request(
                self.client
                    .post(self.table_url(table))
                    .header("Prefer", "return=minimal")
                    .json(chunk),
            );
            send_expect_success(&operation, request).await?;
        }
        Ok(())
    }

    async fn update(&self, table: SyncTable, id: &str, row: &Row) -> Result<u64> {
        let operation = format!("update {table}");
        let request = self.request(
            self.client
                .patch(self.table_url(table))
                .query(&[("id", format!("eq.{id}"))])
                .header("Prefer", "return=representation")
                .json(row),
        );
        let updated = send_rows(&operation, request).await?;
        Ok(u64::try_from(updated.len()).unwrap_or(u64::MAX))
    }

    async fn delete_all(&self, table: SyncTable) -> Result<()> {
        let operation = format!("delete {table}");
        // PostgREST refuses unfiltered deletes
        let request = self.request(
            self.client
                .delete(self.table_url(table))
                .query(&[("id", "not.is.null")])
                .header("Prefer", "return=minimal"),
        );
        send_expect_success(&operation, request).await?;
        tracing::debug!("Deleted all remote {table} rows");
        Ok(())
    }
}

/// PostgREST `in.(...)` filter with every id quoted.
fn in_filter(ids: &[String]) -> String {
    let quoted = ids
        .iter()
        .map(|id| format!("\"{}\"", id.replace('\\', "\\\\").replace('"', "\\\"")))
        .collect::<Vec<_>>()
        .join(",");
    format!("in.({quoted})")
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
    Err(parse_postgrest_error(operation, status, &body).into())
}

async fn send_expect_success(operation: &str, request: RequestBuilder) -> Result<()> {
    send(operation, request).await.map(|_| ())
}

async fn send_rows(operation: &str, request: RequestBuilder) -> Result<Vec<Row>> {
    let response = send(operation, request).await?;
    let values = response
        .json::<Vec<Value>>()
        .await
        .map_err(|error| transport_error(operation, &error))?;
    Ok(values
        .into_iter()
        .filter_map(|value| match value {
            Value::Object(row) => Some(row),
            _ => None,
        })
        .collect())
}

#[derive(Debug, Deserialize)]
struct PostgrestErrorResponse {
    code: Option<String>,
    message: Option<String>,
    details: Option<String>,
    hint: Option<String>,
}

/// Keep PostgREST's own code and message; fall back to the raw body.
fn parse_postgrest_error(operation: &str, status: StatusCode, body: &str) -> RemoteError {
    if let Ok(payload) = serde_json::from_str::<PostgrestErrorResponse>(body) {
        if let Some(message) = payload.message {
            let mut message = message.trim().to_string();
            if let Some(details) = payload.details.filter(|value| !value.trim().is_empty()) {
                message = format!("{message}; {}", details.trim());
            }
            if let Some(hint) = payload.hint.filter(|value| !value.trim().is_empty()) {
                message = format!("{message} (hint: {})", hint.trim());
            }
            let mut error = RemoteError::new(operation, message).with_status(status.as_u16());
            if let Some(code) = payload.code {
                error = error.with_code(code);
            }
            return error;
        }
    }

    let trimmed = compact_text(body);
    let message = if trimmed.is_empty() {
        status
            .canonical_reason()
            .unwrap_or("request failed")
            .to_string()
    } else {
        trimmed
    };
    RemoteError::new(operation, message).with_status(status.as_u16())
}
