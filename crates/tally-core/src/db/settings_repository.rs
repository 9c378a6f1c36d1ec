//! Settings repository implementation

use async_trait::async_trait;
use libsql::Connection;

use crate::error::Result;
use crate::models::SyncEndpointConfig;

use super::local_store::LibSqlStore;

const ENDPOINT_KEY: &str = "sync.endpoint";
const VAULT_SALT_KEY: &str = "vault.salt";

/// Id of the single company settings row.
pub const DEFAULT_SETTING_ID: &str = "default";

/// Sync-related settings: the endpoint (machine-local), the vault salt
/// (machine-local) and `setting.last_sync_at` (synced with the company row).
#[async_trait]
pub trait SettingsRepository: Send + Sync {
    /// Load the endpoint config; defaults when never saved.
    async fn load_endpoint(&self) -> Result<SyncEndpointConfig>;

    async fn save_endpoint(&self, config: &SyncEndpointConfig) -> Result<()>;

    async fn last_sync_at(&self) -> Result<Option<String>>;

    /// Record a completed run, creating the settings row if absent.
    async fn set_last_sync_at(&self, timestamp: &str) -> Result<()>;

    async fn vault_salt(&self) -> Result<Option<String>>;

    async fn save_vault_salt(&self, salt: &str) -> Result<()>;
}

#[async_trait]
impl SettingsRepository for LibSqlStore {
    async fn load_endpoint(&self) -> Result<SyncEndpointConfig> {
        let db = self.db.lock().await;
        match get_config(db.connection(), ENDPOINT_KEY).await? {
            Some(value) => Ok(serde_json::from_str(&value)?),
            None => Ok(SyncEndpointConfig::default()),
        }
    }

    async fn save_endpoint(&self, config: &SyncEndpointConfig) -> Result<()> {
        let value = serde_json::to_string(config)?;
        let db = self.db.lock().await;
        set_config(db.connection(), ENDPOINT_KEY, &value).await
    }

    async fn last_sync_at(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        let mut rows = db
            .connection()
            .query(
                "SELECT last_sync_at FROM setting ORDER BY (id = ?) DESC LIMIT 1",
                [DEFAULT_SETTING_ID],
            )
            .await?;

        match rows.next().await? {
            Some(row) => match row.get_value(0)? {
                libsql::Value::Text(value) => Ok(Some(value)),
                _ => Ok(None),
            },
            None => Ok(None),
        }
    }

    async fn set_last_sync_at(&self, timestamp: &str) -> Result<()> {
        let db = self.db.lock().await;
        let conn = db.connection();
        let affected = conn
            .execute("UPDATE setting SET last_sync_at = ?", [timestamp])
            .await?;
        if affected == 0 {
            conn.execute(
                "INSERT INTO setting (id, last_sync_at) VALUES (?, ?)",
                [DEFAULT_SETTING_ID, timestamp],
            )
            .await?;
        }
        Ok(())
    }

    async fn vault_salt(&self) -> Result<Option<String>> {
        let db = self.db.lock().await;
        get_config(db.connection(), VAULT_SALT_KEY).await
    }

    async fn save_vault_salt(&self, salt: &str) -> Result<()> {
        let db = self.db.lock().await;
        set_config(db.connection(), VAULT_SALT_KEY, salt).await
    }
}

async fn get_config(conn: &Connection, key: &str) -> Result<Option<String>> {
    let mut rows = conn
        .query("SELECT value FROM app_config WHERE key = ?", [key])
        .await?;

    if let Some(row) = rows.next().await? {
        let value: String = row.get(0)?;
        Ok(Some(value))
    } else {
        Ok(None)
    }
}

async fn set_config(conn: &Connection, key: &str, value: &str) -> Result<()> {
    conn.execute(
        "INSERT OR REPLACE INTO app_config (key, value) VALUES (?, ?)",
        [key, value],
    )
    .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::LocalStore;
    use crate::models::{ConflictPolicy, StoredCredential, SyncTable};
    use pretty_assertions::assert_eq;

    #[tokio::test(flavor = "multi_thread")]
    async fn load_endpoint_defaults_when_unsaved() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let config = store.load_endpoint().await.unwrap();
        assert_eq!(config, SyncEndpointConfig::default());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn save_and_load_endpoint() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        let config = SyncEndpointConfig {
            url: Some("https://acme.supabase.co".to_string()),
            credential: Some(StoredCredential::Plaintext {
                secret: "anon".to_string(),
            }),
            enabled: true,
            conflict_policy: ConflictPolicy::LocalWins,
        };

        store.save_endpoint(&config).await.unwrap();
        assert_eq!(store.load_endpoint().await.unwrap(), config);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn last_sync_at_creates_settings_row() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        assert_eq!(store.last_sync_at().await.unwrap(), None);

        store
            .set_last_sync_at("2024-05-01T10:00:00.000Z")
            .await
            .unwrap();
        store
            .set_last_sync_at("2024-05-02T10:00:00.000Z")
            .await
            .unwrap();

        assert_eq!(
            store.last_sync_at().await.unwrap().as_deref(),
            Some("2024-05-02T10:00:00.000Z")
        );
        assert_eq!(
            store.fetch_ids(SyncTable::Setting).await.unwrap(),
            vec![DEFAULT_SETTING_ID]
        );
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn vault_salt_roundtrip() {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        assert_eq!(store.vault_salt().await.unwrap(), None);
        store.save_vault_salt("c2FsdA==").await.unwrap();
        assert_eq!(store.vault_salt().await.unwrap().as_deref(), Some("c2FsdA=="));
    }
}
