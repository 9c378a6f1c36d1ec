//! Resolution of the stored sync endpoint into a usable URL and key.

use std::sync::Arc;

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use serde::Deserialize;

use crate::db::SettingsRepository;
use crate::error::{Error, Result};
use crate::models::ConflictPolicy;
use crate::util::normalize_text_option;
use crate::vault::{SecretString, Vault};

/// Role claim that grants delete-all access on the remote service.
pub const ELEVATED_ROLE: &str = "service_role";

const SECRET_KEY_PREFIX: &str = "sb_secret_";
const PUBLISHABLE_KEY_PREFIX: &str = "sb_publishable_";

/// Endpoint ready for connecting: URL plus the opened credential.
#[derive(Debug, Clone)]
pub struct ResolvedEndpoint {
    pub url: String,
    pub key: SecretString,
    pub conflict_policy: ConflictPolicy,
}

impl ResolvedEndpoint {
    /// Role claimed by the key, if it carries one.
    pub fn role(&self) -> Option<String> {
        credential_role(self.key.expose())
    }

    pub fn is_elevated(&self) -> bool {
        self.role().as_deref() == Some(ELEVATED_ROLE)
    }
}

/// Reads the endpoint config and opens its credential through the vault.
#[derive(Clone)]
pub struct CredentialResolver {
    settings: Arc<dyn SettingsRepository>,
    vault: Vault,
}

impl CredentialResolver {
    pub fn new(settings: Arc<dyn SettingsRepository>, vault: Vault) -> Self {
        Self { settings, vault }
    }

    /// `Ok(None)` when sync is unavailable (no URL, no credential, or
    /// disabled). Encrypted credentials need an unlocked vault and fail with
    /// [`Error::Locked`] otherwise.
    pub async fn resolve(&self) -> Result<Option<ResolvedEndpoint>> {
        let config = self.settings.load_endpoint().await?;
        if !config.enabled {
            return Ok(None);
        }
        let Some(url) = normalize_text_option(config.url) else {
            return Ok(None);
        };
        let Some(credential) = config.credential else {
            return Ok(None);
        };

        let key = self.vault.open(&credential)?;
        if key.expose().trim().is_empty() {
            return Ok(None);
        }

        Ok(Some(ResolvedEndpoint {
            url: url.trim_end_matches('/').to_string(),
            key,
            conflict_policy: config.conflict_policy,
        }))
    }

    /// Resolve for a destructive remote operation.
    ///
    /// Purely local: the key's role claim must be [`ELEVATED_ROLE`] or the
    /// call fails with [`Error::Unauthorized`] before any connection exists.
    pub async fn resolve_elevated(&self) -> Result<ResolvedEndpoint> {
        let endpoint = self.resolve().await?.ok_or(Error::NotConfigured)?;
        match endpoint.role() {
            Some(role) if role == ELEVATED_ROLE => Ok(endpoint),
            Some(role) => Err(Error::Unauthorized(format!(
                "credential role '{role}' cannot replace remote data; a {ELEVATED_ROLE} key is required"
            ))),
            None => Err(Error::Unauthorized(format!(
                "credential carries no role claim; a {ELEVATED_ROLE} key is required"
            ))),
        }
    }
}

#[derive(Deserialize)]
struct RoleClaims {
    #[serde(default)]
    role: Option<String>,
}

/// Decode the role a credential claims without verifying its signature.
///
/// JWT keys carry a `role` claim in their payload; opaque Supabase keys are
/// classified by prefix.
pub fn credential_role(key: &str) -> Option<String> {
    let key = key.trim();
    if key.starts_with(SECRET_KEY_PREFIX) {
        return Some(ELEVATED_ROLE.to_string());
    }
    if key.starts_with(PUBLISHABLE_KEY_PREFIX) {
        return Some("anon".to_string());
    }

    let mut segments = key.split('.');
    let (_header, payload, _signature) = (segments.next()?, segments.next()?, segments.next()?);
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: RoleClaims = serde_json::from_slice(&bytes).ok()?;
    normalize_text_option(claims.role)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::LibSqlStore;
    use crate::models::{StoredCredential, SyncEndpointConfig};
    use crate::vault::{VaultKey, KEY_SIZE};
    use serde_json::json;

    /// Unsigned JWT-shaped key with the given role claim.
    pub(crate) fn jwt_with_role(role: &str) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let payload = URL_SAFE_NO_PAD.encode(
            json!({ "iss": "supabase", "role": role, "ref": "acme" })
                .to_string()
                .as_bytes(),
        );
        format!("{header}.{payload}.signature")
    }

    async fn resolver_with(config: SyncEndpointConfig, vault: Vault) -> CredentialResolver {
        let store = LibSqlStore::open_in_memory().await.unwrap();
        store.save_endpoint(&config).await.unwrap();
        CredentialResolver::new(Arc::new(store), vault)
    }

    fn plaintext_config(key: &str) -> SyncEndpointConfig {
        SyncEndpointConfig {
            url: Some("https://acme.supabase.co/".to_string()),
            credential: Some(StoredCredential::Plaintext {
                secret: key.to_string(),
            }),
            enabled: true,
            conflict_policy: ConflictPolicy::CloudWins,
        }
    }

    #[test]
    fn credential_role_reads_jwt_payload() {
        assert_eq!(
            credential_role(&jwt_with_role("service_role")).as_deref(),
            Some("service_role")
        );
        assert_eq!(credential_role(&jwt_with_role("anon")).as_deref(), Some("anon"));
        assert_eq!(credential_role("not-a-jwt"), None);
    }

    #[test]
    fn credential_role_classifies_opaque_keys() {
        assert_eq!(
            credential_role("sb_secret_abc123").as_deref(),
            Some(ELEVATED_ROLE)
        );
        assert_eq!(credential_role("sb_publishable_abc").as_deref(), Some("anon"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn unconfigured_or_disabled_is_none() {
        let resolver = resolver_with(SyncEndpointConfig::default(), Vault::locked()).await;
        assert!(resolver.resolve().await.unwrap().is_none());

        let disabled = SyncEndpointConfig {
            enabled: false,
            ..plaintext_config("anon")
        };
        let resolver = resolver_with(disabled, Vault::locked()).await;
        assert!(resolver.resolve().await.unwrap().is_none());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn plaintext_resolves_and_trims_url() {
        let resolver = resolver_with(plaintext_config("anon-key"), Vault::locked()).await;
        let endpoint = resolver.resolve().await.unwrap().unwrap();
        assert_eq!(endpoint.url, "https://acme.supabase.co");
        assert_eq!(endpoint.key.expose(), "anon-key");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn encrypted_credential_requires_unlock() {
        let vault = Vault::locked();
        vault
            .unlock_with_key(VaultKey::from_bytes([3; KEY_SIZE]))
            .unwrap();
        let config = SyncEndpointConfig {
            credential: Some(vault.seal("sealed-key").unwrap()),
            ..plaintext_config("unused")
        };
        let resolver = resolver_with(config, vault.clone()).await;

        let endpoint = resolver.resolve().await.unwrap().unwrap();
        assert_eq!(endpoint.key.expose(), "sealed-key");

        vault.lock();
        assert!(matches!(resolver.resolve().await, Err(Error::Locked)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn elevated_gate_rejects_anon_keys() {
        let resolver =
            resolver_with(plaintext_config(&jwt_with_role("anon")), Vault::locked()).await;
        assert!(matches!(
            resolver.resolve_elevated().await,
            Err(Error::Unauthorized(_))
        ));

        let resolver = resolver_with(
            plaintext_config(&jwt_with_role(ELEVATED_ROLE)),
            Vault::locked(),
        )
        .await;
        assert!(resolver.resolve_elevated().await.unwrap().is_elevated());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn elevated_gate_reports_not_configured() {
        let resolver = resolver_with(SyncEndpointConfig::default(), Vault::locked()).await;
        assert!(matches!(
            resolver.resolve_elevated().await,
            Err(Error::NotConfigured)
        ));
    }
}
