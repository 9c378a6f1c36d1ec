//! Secret vault: an in-memory unlock session that seals and opens the stored
//! sync credential.
//!
//! Keys are derived from a passphrase with Argon2id and credentials are
//! sealed with ChaCha20-Poly1305. The vault never writes anything itself;
//! callers persist the sealed [`StoredCredential`] and the salt.

use std::fmt;
use std::sync::{Arc, RwLock};

use argon2::{Argon2, Params, Version};
use base64::{engine::general_purpose::STANDARD, Engine};
use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::RngCore;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::error::{Error, Result};
use crate::models::StoredCredential;

/// Size of vault keys in bytes (256 bits for ChaCha20).
pub const KEY_SIZE: usize = 32;

/// Size of the key-derivation salt in bytes.
pub const SALT_SIZE: usize = 16;

const NONCE_SIZE: usize = 12;

// OWASP Argon2id baseline: 19 MiB, 2 passes, 1 lane
const KDF_MEMORY_KIB: u32 = 19 * 1024;
const KDF_TIME_COST: u32 = 2;
const KDF_PARALLELISM: u32 = 1;

/// A decrypted secret held only in memory.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Borrow the secret value. Never log the result.
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretString([REDACTED])")
    }
}

/// Symmetric key of an unlock session.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct VaultKey {
    bytes: [u8; KEY_SIZE],
}

impl VaultKey {
    pub const fn from_bytes(bytes: [u8; KEY_SIZE]) -> Self {
        Self { bytes }
    }

    /// Derive a key from a passphrase and salt with Argon2id.
    pub fn derive(passphrase: &str, salt: &[u8]) -> Result<Self> {
        if passphrase.is_empty() {
            return Err(Error::Vault("Passphrase must not be empty".to_string()));
        }
        let params = Params::new(
            KDF_MEMORY_KIB,
            KDF_TIME_COST,
            KDF_PARALLELISM,
            Some(KEY_SIZE),
        )
        .map_err(|error| Error::Vault(error.to_string()))?;
        let argon2 = Argon2::new(argon2::Algorithm::Argon2id, Version::V0x13, params);

        let mut bytes = [0u8; KEY_SIZE];
        argon2
            .hash_password_into(passphrase.as_bytes(), salt, &mut bytes)
            .map_err(|error| Error::Vault(error.to_string()))?;
        Ok(Self { bytes })
    }
}

impl fmt::Debug for VaultKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VaultKey")
            .field("bytes", &"[REDACTED]")
            .finish()
    }
}

/// Generate a random base64 salt for [`VaultKey::derive`].
pub fn generate_salt() -> String {
    let mut bytes = [0u8; SALT_SIZE];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    STANDARD.encode(bytes)
}

/// Shared handle to the unlock session. Cloning shares the session.
#[derive(Clone, Default)]
pub struct Vault {
    session: Arc<RwLock<Option<VaultKey>>>,
}

impl fmt::Debug for Vault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Vault")
            .field("unlocked", &self.is_unlocked())
            .finish()
    }
}

impl Vault {
    /// A vault with no active unlock session.
    pub fn locked() -> Self {
        Self::default()
    }

    /// Start an unlock session from a passphrase and base64 salt.
    pub fn unlock(&self, passphrase: &str, salt_b64: &str) -> Result<()> {
        let salt = STANDARD
            .decode(salt_b64.trim())
            .map_err(|error| Error::Vault(format!("Invalid vault salt: {error}")))?;
        let key = VaultKey::derive(passphrase, &salt)?;
        self.unlock_with_key(key)
    }

    pub fn unlock_with_key(&self, key: VaultKey) -> Result<()> {
        let mut session = self
            .session
            .write()
            .map_err(|_| Error::Vault("Vault session lock poisoned".to_string()))?;
        *session = Some(key);
        tracing::debug!("Vault unlocked");
        Ok(())
    }

    /// End the unlock session; sealed credentials become unreadable.
    pub fn lock(&self) {
        if let Ok(mut session) = self.session.write() {
            *session = None;
        }
    }

    pub fn is_unlocked(&self) -> bool {
        self.session
            .read()
            .map(|session| session.is_some())
            .unwrap_or(false)
    }

    /// Seal `secret` when unlocked; store it as plaintext otherwise.
    pub fn seal(&self, secret: &str) -> Result<StoredCredential> {
        let session = self
            .session
            .read()
            .map_err(|_| Error::Vault("Vault session lock poisoned".to_string()))?;
        let Some(key) = session.as_ref() else {
            return Ok(StoredCredential::Plaintext {
                secret: secret.to_string(),
            });
        };

        let cipher = ChaCha20Poly1305::new(key.bytes.as_ref().into());
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        rand::rngs::OsRng.fill_bytes(&mut nonce_bytes);
        let ciphertext = cipher
            .encrypt(Nonce::from_slice(&nonce_bytes), secret.as_bytes())
            .map_err(|error| Error::Vault(format!("Encryption failed: {error}")))?;

        Ok(StoredCredential::Encrypted {
            iv: STANDARD.encode(nonce_bytes),
            ciphertext: STANDARD.encode(ciphertext),
        })
    }

    /// Open a stored credential. Encrypted credentials fail with
    /// [`Error::Locked`] when no unlock session is active.
    pub fn open(&self, credential: &StoredCredential) -> Result<SecretString> {
        let (iv, ciphertext) = match credential {
            StoredCredential::Plaintext { secret } => return Ok(SecretString::new(secret.clone())),
            StoredCredential::Encrypted { iv, ciphertext } => (iv, ciphertext),
        };

        let session = self
            .session
            .read()
            .map_err(|_| Error::Vault("Vault session lock poisoned".to_string()))?;
        let key = session.as_ref().ok_or(Error::Locked)?;

        let nonce = STANDARD
            .decode(iv)
            .map_err(|error| Error::Vault(format!("Invalid credential iv: {error}")))?;
        if nonce.len() != NONCE_SIZE {
            return Err(Error::Vault(format!(
                "Invalid credential iv length {} (expected {NONCE_SIZE})",
                nonce.len()
            )));
        }
        let ciphertext = STANDARD
            .decode(ciphertext)
            .map_err(|error| Error::Vault(format!("Invalid credential ciphertext: {error}")))?;

        let cipher = ChaCha20Poly1305::new(key.bytes.as_ref().into());
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&nonce), ciphertext.as_ref())
            .map_err(|_| {
                Error::Vault("Decryption failed (wrong passphrase or tampered data)".to_string())
            })?;
        let secret = String::from_utf8(plaintext)
            .map_err(|error| Error::Vault(format!("Credential is not UTF-8: {error}")))?;
        Ok(SecretString::new(secret))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unlocked_vault(seed: u8) -> Vault {
        let vault = Vault::locked();
        vault
            .unlock_with_key(VaultKey::from_bytes([seed; KEY_SIZE]))
            .unwrap();
        vault
    }

    #[test]
    fn seal_without_session_stores_plaintext() {
        let vault = Vault::locked();
        let sealed = vault.seal("anon-key").unwrap();
        assert_eq!(
            sealed,
            StoredCredential::Plaintext {
                secret: "anon-key".to_string()
            }
        );
        assert_eq!(vault.open(&sealed).unwrap().expose(), "anon-key");
    }

    #[test]
    fn sealed_credential_opens_while_unlocked() {
        let vault = unlocked_vault(7);
        let sealed = vault.seal("service-key").unwrap();
        assert!(sealed.is_encrypted());
        assert_eq!(vault.open(&sealed).unwrap().expose(), "service-key");
    }

    #[test]
    fn sealed_credential_fails_closed_when_locked() {
        let vault = unlocked_vault(7);
        let sealed = vault.seal("service-key").unwrap();
        vault.lock();

        assert!(matches!(vault.open(&sealed), Err(Error::Locked)));
    }

    #[test]
    fn wrong_key_is_a_vault_error() {
        let sealed = unlocked_vault(1).seal("service-key").unwrap();
        let other = unlocked_vault(2);
        assert!(matches!(other.open(&sealed), Err(Error::Vault(_))));
    }

    #[test]
    fn passphrase_derivation_is_deterministic_per_salt() {
        let salt = generate_salt();
        let first = Vault::locked();
        first.unlock("correct horse", &salt).unwrap();
        let sealed = first.seal("secret").unwrap();

        let second = Vault::locked();
        second.unlock("correct horse", &salt).unwrap();
        assert_eq!(second.open(&sealed).unwrap().expose(), "secret");
    }

    #[test]
    fn secret_debug_is_redacted() {
        let secret = SecretString::new("hunter2");
        assert!(!format!("{secret:?}").contains("hunter2"));
    }
}
