//! Schema-driven row access to the local database

use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine};
use libsql::params::Params;
use libsql::{Connection, Value as SqlValue};
use serde_json::{Number, Value};
use tokio::sync::Mutex;

use crate::error::{Error, Result};
use crate::models::{row_id, Row, SyncTable, TableSchema};

use super::connection::Database;

/// Largest `IN (...)` list bound in one statement.
const ID_CHUNK: usize = 500;

/// A table's full replacement inside [`LocalStore::replace_tables`].
#[derive(Debug, Clone, PartialEq)]
pub struct TableSnapshot {
    pub table: SyncTable,
    pub rows: Vec<Row>,
}

/// Row-level operations on the local side of a sync.
#[async_trait]
pub trait LocalStore: Send + Sync {
    /// Every row of `table`.
    async fn fetch_all(&self, table: SyncTable) -> Result<Vec<Row>>;

    /// Every `id` of `table`.
    async fn fetch_ids(&self, table: SyncTable) -> Result<Vec<String>>;

    /// Rows of `table` whose `id` is in `ids`. Unknown ids are skipped.
    async fn fetch_by_ids(&self, table: SyncTable, ids: &[String]) -> Result<Vec<Row>>;

    /// Insert a row; fails if the id already exists.
    async fn insert(&self, table: SyncTable, row: &Row) -> Result<()>;

    /// Update the row with the same id, or insert it when none matched.
    async fn upsert(&self, table: SyncTable, row: &Row) -> Result<()>;

    /// Delete by id, returning the number of rows removed.
    async fn delete_by_id(&self, table: SyncTable, id: &str) -> Result<u64>;

    /// In one transaction, empty every table in `clear` (in order), then
    /// insert each snapshot (in order). Rolls back on any failure and reports
    /// [`Error::Transaction`]. Returns the number of rows inserted.
    async fn replace_tables(&self, clear: &[SyncTable], snapshots: &[TableSnapshot])
        -> Result<u64>;
}

/// libSQL implementation of [`LocalStore`].
///
/// Statements are serialized through the connection mutex, so concurrent
/// writers (a sync run and realtime events) interleave statement by statement.
#[derive(Clone)]
pub struct LibSqlStore {
    pub(super) db: Arc<Mutex<Database>>,
    db_path: Option<PathBuf>,
}

impl LibSqlStore {
    /// Open (and migrate) the database at `db_path`, creating parent directories.
    pub async fn open_path(db_path: impl Into<PathBuf>) -> Result<Self> {
        let db_path = db_path.into();
        if let Some(parent) = db_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Database::open(&db_path).await?;
        tracing::debug!("Opened local database at {}", db_path.display());
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: Some(db_path),
        })
    }

    /// Open an in-memory store (primarily for tests).
    pub async fn open_in_memory() -> Result<Self> {
        let db = Database::open_in_memory().await?;
        Ok(Self {
            db: Arc::new(Mutex::new(db)),
            db_path: None,
        })
    }

    pub fn db_path(&self) -> Option<&PathBuf> {
        self.db_path.as_ref()
    }
}

#[async_trait]
impl LocalStore for LibSqlStore {
    async fn fetch_all(&self, table: SyncTable) -> Result<Vec<Row>> {
        let schema = table.schema();
        let sql = format!(
            "SELECT {} FROM {} ORDER BY {}",
            schema.columns.join(", "),
            schema.name,
            schema.key
        );
        let db = self.db.lock().await;
        query_rows(db.connection(), schema, &sql, Params::None).await
    }

    async fn fetch_ids(&self, table: SyncTable) -> Result<Vec<String>> {
        let schema = table.schema();
        let sql = format!("SELECT {} FROM {}", schema.key, schema.name);
        let db = self.db.lock().await;
        let mut rows = db.connection().query(&sql, ()).await?;

        let mut ids = Vec::new();
        while let Some(row) = rows.next().await? {
            match row.get_value(0)? {
                SqlValue::Text(id) => ids.push(id),
                SqlValue::Integer(id) => ids.push(id.to_string()),
                _ => {}
            }
        }
        Ok(ids)
    }

    async fn fetch_by_ids(&self, table: SyncTable, ids: &[String]) -> Result<Vec<Row>> {
        let schema = table.schema();
        let db = self.db.lock().await;
        let mut found = Vec::with_capacity(ids.len());
        for chunk in ids.chunks(ID_CHUNK) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT {} FROM {} WHERE {} IN ({placeholders})",
                schema.columns.join(", "),
                schema.name,
                schema.key
            );
            let params = Params::Positional(
                chunk
                    .iter()
                    .map(|id| SqlValue::Text(id.clone()))
                    .collect(),
            );
            found.extend(query_rows(db.connection(), schema, &sql, params).await?);
        }
        Ok(found)
    }

    async fn insert(&self, table: SyncTable, row: &Row) -> Result<()> {
        let db = self.db.lock().await;
        insert_row(db.connection(), table.schema(), row).await
    }

    async fn upsert(&self, table: SyncTable, row: &Row) -> Result<()> {
        let schema = table.schema();
        let id = row_id(row).ok_or_else(|| {
            Error::InvalidInput(format!("Cannot upsert {} row without an id", schema.name))
        })?;
        let assignments = row_columns(schema, row)
            .filter(|(column, _)| *column != schema.key)
            .collect::<Vec<_>>();

        let db = self.db.lock().await;
        let conn = db.connection();
        if assignments.is_empty() {
            let sql = format!(
                "INSERT OR IGNORE INTO {} ({}) VALUES (?)",
                schema.name, schema.key
            );
            conn.execute(&sql, Params::Positional(vec![SqlValue::Text(id)]))
                .await?;
            return Ok(());
        }

        let set_clause = assignments
            .iter()
            .map(|(column, _)| format!("{column} = ?"))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "UPDATE {} SET {set_clause} WHERE {} = ?",
            schema.name, schema.key
        );
        let mut values = assignments
            .into_iter()
            .map(|(_, value)| json_to_sql(value))
            .collect::<Vec<_>>();
        values.push(SqlValue::Text(id));

        let affected = conn.execute(&sql, Params::Positional(values)).await?;
        if affected == 0 {
            insert_row(conn, schema, row).await?;
        }
        Ok(())
    }

    async fn delete_by_id(&self, table: SyncTable, id: &str) -> Result<u64> {
        let schema = table.schema();
        let sql = format!("DELETE FROM {} WHERE {} = ?", schema.name, schema.key);
        let db = self.db.lock().await;
        let affected = db.connection().execute(&sql, [id]).await?;
        Ok(affected)
    }

    async fn replace_tables(
        &self,
        clear: &[SyncTable],
        snapshots: &[TableSnapshot],
    ) -> Result<u64> {
        let db = self.db.lock().await;
        let conn = db.connection();
        conn.execute("BEGIN TRANSACTION", ())
            .await
            .map_err(|error| Error::Transaction(error.to_string()))?;

        match replace_in_transaction(conn, clear, snapshots).await {
            Ok(inserted) => {
                if let Err(error) = conn.execute("COMMIT", ()).await {
                    conn.execute("ROLLBACK", ()).await.ok();
                    return Err(Error::Transaction(error.to_string()));
                }
                tracing::info!(
                    "Replaced {} local tables with {inserted} rows",
                    snapshots.len()
                );
                Ok(inserted)
            }
            Err(error) => {
                conn.execute("ROLLBACK", ()).await.ok();
                tracing::warn!("Rolled back local table replacement: {error}");
                Err(Error::Transaction(error.to_string()))
            }
        }
    }
}

async fn replace_in_transaction(
    conn: &Connection,
    clear: &[SyncTable],
    snapshots: &[TableSnapshot],
) -> Result<u64> {
    for table in clear {
        conn.execute(&format!("DELETE FROM {}", table.name()), ())
            .await?;
    }
    let mut inserted = 0;
    for snapshot in snapshots {
        let schema = snapshot.table.schema();
        for row in &snapshot.rows {
            insert_row(conn, schema, row).await?;
            inserted += 1;
        }
    }
    Ok(inserted)
}

/// Columns of `row` known to `schema`, in row order. Unknown remote columns
/// are dropped.
fn row_columns<'a>(
    schema: &'a TableSchema,
    row: &'a Row,
) -> impl Iterator<Item = (&'a str, &'a Value)> + 'a {
    row.iter()
        .filter(|(column, _)| schema.has_column(column))
        .map(|(column, value)| (column.as_str(), value))
}

async fn insert_row(conn: &Connection, schema: &TableSchema, row: &Row) -> Result<()> {
    let (columns, values): (Vec<&str>, Vec<SqlValue>) = row_columns(schema, row)
        .map(|(column, value)| (column, json_to_sql(value)))
        .unzip();
    if !columns.contains(&schema.key) {
        return Err(Error::InvalidInput(format!(
            "Cannot insert {} row without an id",
            schema.name
        )));
    }
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {} ({}) VALUES ({placeholders})",
        schema.name,
        columns.join(", ")
    );
    conn.execute(&sql, Params::Positional(values)).await?;
    Ok(())
}

async fn query_rows(
    conn: &Connection,
    schema: &TableSchema,
    sql: &str,
    params: Params,
) -> Result<Vec<Row>> {
    let mut rows = conn.query(sql, params).await?;
    let mut out = Vec::new();
    while let Some(row) = rows.next().await? {
        let mut record = Row::new();
        for (index, column) in (0_i32..).zip(schema.columns) {
            record.insert((*column).to_string(), sql_to_json(row.get_value(index)?));
        }
        out.push(record);
    }
    Ok(out)
}

fn json_to_sql(value: &Value) -> SqlValue {
    match value {
        Value::Null => SqlValue::Null,
        Value::Bool(flag) => SqlValue::Integer(i64::from(*flag)),
        Value::Number(number) => number.as_i64().map_or_else(
            || SqlValue::Real(number.as_f64().unwrap_or_default()),
            SqlValue::Integer,
        ),
        Value::String(text) => SqlValue::Text(text.clone()),
        // nested JSON (e.g. automation payloads) is stored as text
        other => SqlValue::Text(other.to_string()),
    }
}

fn sql_to_json(value: SqlValue) -> Value {
    match value {
        SqlValue::Null => Value::Null,
        SqlValue::Integer(number) => Value::Number(number.into()),
        SqlValue::Real(number) => Number::from_f64(number).map_or(Value::Null, Value::Number),
        SqlValue::Text(text) => Value::String(text),
        SqlValue::Blob(bytes) => Value::String(STANDARD.encode(bytes)),
    }
}
