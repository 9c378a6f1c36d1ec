//! Lazily built, cached connection to the remote service.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::config::SyncRuntimeConfig;
use crate::credential::ResolvedEndpoint;
use crate::error::Result;
use crate::vault::SecretString;

use super::{
    BlobStore, PostgrestTables, R2BlobStore, RemoteHandle, SupabaseRealtime, SupabaseStorage,
};

/// Builds a [`RemoteHandle`] for a resolved endpoint.
pub trait RemoteFactory: Send + Sync {
    fn build(&self, endpoint: &ResolvedEndpoint) -> Result<RemoteHandle>;
}

/// Supabase rows and realtime, with documents in Supabase Storage or R2.
#[derive(Debug, Clone)]
pub struct SupabaseFactory {
    runtime: SyncRuntimeConfig,
}

impl SupabaseFactory {
    pub const fn new(runtime: SyncRuntimeConfig) -> Self {
        Self { runtime }
    }
}

impl RemoteFactory for SupabaseFactory {
    fn build(&self, endpoint: &ResolvedEndpoint) -> Result<RemoteHandle> {
        let timeout = self.runtime.http_timeout;
        let tables = PostgrestTables::new(&endpoint.url, endpoint.key.clone(), timeout)?;
        let blobs: Arc<dyn BlobStore> = match &self.runtime.r2 {
            Some(r2) => Arc::new(R2BlobStore::new(r2)),
            None => Arc::new(SupabaseStorage::new(
                &endpoint.url,
                self.runtime.storage_bucket.clone(),
                endpoint.key.clone(),
                timeout,
            )?),
        };
        Ok(RemoteHandle {
            tables: Arc::new(tables),
            blobs,
            changes: Arc::new(SupabaseRealtime::new(&endpoint.url, endpoint.key.clone())),
        })
    }
}

struct Cached {
    url: String,
    key: SecretString,
    handle: RemoteHandle,
}

/// Hands out one shared [`RemoteHandle`] per URL/key pair.
///
/// A new pair replaces the cached handle; remote call failures never do.
pub struct RemoteConnector {
    factory: Arc<dyn RemoteFactory>,
    cached: Mutex<Option<Cached>>,
}

impl std::fmt::Debug for RemoteConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnector").finish_non_exhaustive()
    }
}

impl RemoteConnector {
    pub fn new(factory: Arc<dyn RemoteFactory>) -> Self {
        Self {
            factory,
            cached: Mutex::new(None),
        }
    }

    pub async fn connect(&self, endpoint: &ResolvedEndpoint) -> Result<RemoteHandle> {
        let mut cached = self.cached.lock().await;
        if let Some(current) = cached.as_ref() {
            if current.url == endpoint.url && current.key == endpoint.key {
                return Ok(current.handle.clone());
            }
            tracing::debug!("Sync endpoint changed, rebuilding remote connection");
        }

        let handle = self.factory.build(endpoint)?;
        *cached = Some(Cached {
            url: endpoint.url.clone(),
            key: endpoint.key.clone(),
            handle: handle.clone(),
        });
        Ok(handle)
    }

    /// Drop the cached handle; the next `connect` builds a fresh one.
    pub async fn invalidate(&self) {
        self.cached.lock().await.take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ConflictPolicy;
    use crate::remote::memory::MemoryRemote;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct CountingFactory {
        builds: AtomicUsize,
    }

    impl RemoteFactory for CountingFactory {
        fn build(&self, _endpoint: &ResolvedEndpoint) -> Result<RemoteHandle> {
            self.builds.fetch_add(1, Ordering::SeqCst);
            Ok(MemoryRemote::new().handle())
        }
    }

    fn endpoint(url: &str, key: &str) -> ResolvedEndpoint {
        ResolvedEndpoint {
            url: url.to_string(),
            key: SecretString::new(key),
            conflict_policy: ConflictPolicy::CloudWins,
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn reuses_handle_while_endpoint_is_unchanged() {
        let factory = Arc::new(CountingFactory::default());
        let connector = RemoteConnector::new(factory.clone());

        let first = connector.connect(&endpoint("https://a.example", "k1")).await.unwrap();
        let second = connector.connect(&endpoint("https://a.example", "k1")).await.unwrap();
        assert!(first.same_as(&second));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 1);

        let rekeyed = connector.connect(&endpoint("https://a.example", "k2")).await.unwrap();
        assert!(!rekeyed.same_as(&first));
        let moved = connector.connect(&endpoint("https://b.example", "k2")).await.unwrap();
        assert!(!moved.same_as(&rekeyed));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn invalidate_forces_rebuild() {
        let factory = Arc::new(CountingFactory::default());
        let connector = RemoteConnector::new(factory.clone());
        let target = endpoint("https://a.example", "k1");

        let first = connector.connect(&target).await.unwrap();
        connector.invalidate().await;
        let second = connector.connect(&target).await.unwrap();
        assert!(!first.same_as(&second));
        assert_eq!(factory.builds.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn supabase_factory_builds_without_network() {
        let factory = SupabaseFactory::new(SyncRuntimeConfig::default());
        assert!(factory.build(&endpoint("https://acme.supabase.co", "k")).is_ok());
    }
}
