//! Stored sync endpoint configuration

use std::fmt;

use serde::{Deserialize, Serialize};

use super::sync::ConflictPolicy;

/// Remote credential as persisted in local settings.
///
/// The credential is plaintext only when it was saved without an active
/// vault session; otherwise it is sealed and can only be opened while the
/// vault is unlocked.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum StoredCredential {
    Plaintext {
        secret: String,
    },
    Encrypted {
        /// Base64 nonce.
        iv: String,
        /// Base64 ciphertext including the authentication tag.
        ciphertext: String,
    },
}

impl StoredCredential {
    pub const fn is_encrypted(&self) -> bool {
        matches!(self, Self::Encrypted { .. })
    }
}

impl fmt::Debug for StoredCredential {
    fn fmt(&self, formatter: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Plaintext { .. } => formatter
                .debug_struct("Plaintext")
                .field("secret", &"[REDACTED]")
                .finish(),
            Self::Encrypted { iv, .. } => formatter
                .debug_struct("Encrypted")
                .field("iv", iv)
                .field("ciphertext", &"[REDACTED]")
                .finish(),
        }
    }
}

/// Remote endpoint settings, read once per sync run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncEndpointConfig {
    #[serde(default)]
    pub url: Option<String>,
    #[serde(default)]
    pub credential: Option<StoredCredential>,
    #[serde(default)]
    pub enabled: bool,
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
}

impl SyncEndpointConfig {
    /// Whether URL and credential are both present (regardless of `enabled`).
    pub fn is_configured(&self) -> bool {
        self.url
            .as_deref()
            .is_some_and(|url| !url.trim().is_empty())
            && self.credential.is_some()
    }
}
