// src/registry/mod.rs

//! Cluster registry: the schema and protocols on top of a [`KvStore`].
//!
//! Layout under the configured prefix:
//!
//! ```text
//! <prefix>/process/{procID}-{machID}-{svcName}/desired-state
//!                                             /current-state
//!                                             /alive          (TTL)
//!                                             /object         (JSON run info)
//! <prefix>/machine/{machID}/object                            (JSON machine info)
//!                          /alive                             (TTL)
//!                          /statistic                         (JSON machine stat)
//! <prefix>/max-process-id                                     (decimal counter)
//! <prefix>/bootstrapped                                       (marker)
//! <prefix>/job/*                                              (event watch root)
//! ```
//!
//! Every store call goes through [`Registry::call`], which applies the
//! per-request timeout. Elapsed requests surface as `Unavailable`.

mod backoff;
mod bootstrap;
mod event;
mod machine;
mod process;

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::errors::Result;
use crate::store::{KvStore, SetOptions, StoreError, StoreFuture, join_key};

pub use backoff::{BackoffPolicy, IdRetry};
pub use event::{EventStream, RegistryEvent};

pub(crate) const PROCESS_DIR: &str = "process";
pub(crate) const MACHINE_DIR: &str = "machine";
pub(crate) const JOB_DIR: &str = "job";
pub(crate) const MAX_PROC_ID_KEY: &str = "max-process-id";
pub(crate) const BOOTSTRAPPED_KEY: &str = "bootstrapped";
pub(crate) const BOOTSTRAPPED_VALUE: &str = "bootstrapped";

pub(crate) const DESIRED_STATE: &str = "desired-state";
pub(crate) const CURRENT_STATE: &str = "current-state";
pub(crate) const ALIVE: &str = "alive";
pub(crate) const OBJECT: &str = "object";
pub(crate) const STATISTIC: &str = "statistic";

/// First value of the process ID counter after bootstrap.
pub const FIRST_PROC_ID: u64 = 10000;

/// Client over the cluster key-value store.
///
/// Cheap to clone; all clones share the same backend.
#[derive(Debug, Clone)]
pub struct Registry {
    store: Arc<dyn KvStore>,
    prefix: String,
    request_timeout: Duration,
    addrs: String,
    id_retry: IdRetry,
}

impl Registry {
    /// `addrs` is the connection string advertised to supervised processes
    /// (see [`Registry::endpoints`]).
    pub fn new(
        store: Arc<dyn KvStore>,
        prefix: &str,
        request_timeout: Duration,
        addrs: impl Into<String>,
    ) -> Self {
        Self {
            store,
            prefix: join_key(&[prefix]),
            request_timeout,
            addrs: addrs.into(),
            id_retry: IdRetry::default(),
        }
    }

    pub fn with_id_retry(mut self, id_retry: IdRetry) -> Self {
        self.id_retry = id_retry;
        self
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Registry connection string, e.g. `127.0.0.1:2379,127.0.0.1:4001`.
    pub fn endpoints(&self) -> &str {
        &self.addrs
    }

    pub fn store(&self) -> &Arc<dyn KvStore> {
        &self.store
    }

    /// Absolute key for `parts` under the prefix.
    pub(crate) fn key(&self, parts: &[&str]) -> String {
        let mut all = Vec::with_capacity(parts.len() + 1);
        all.push(self.prefix.as_str());
        all.extend_from_slice(parts);
        join_key(&all)
    }

    /// Run one store request under the request timeout.
    pub(crate) async fn call<T>(
        &self,
        op: &str,
        fut: StoreFuture<'_, T>,
    ) -> std::result::Result<T, StoreError> {
        match tokio::time::timeout(self.request_timeout, fut).await {
            Ok(res) => res,
            Err(_) => {
                debug!(op, timeout = ?self.request_timeout, "registry request timed out");
                Err(StoreError::Unavailable(format!(
                    "{op} timed out after {:?}",
                    self.request_timeout
                )))
            }
        }
    }

    /// Reset the TTL of `key`, creating it when it has expired or never
    /// existed.
    pub(crate) async fn refresh_or_create_alive(&self, key: &str, ttl: Duration) -> Result<()> {
        match self
            .call("refresh alive key", self.store.set(key, "", SetOptions::refresh(ttl)))
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::KeyNotFound(_)) => {
                self.call(
                    "create alive key",
                    self.store.set(key, "", SetOptions::default().with_ttl(ttl)),
                )
                .await?;
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::Error;
    use crate::store::{GetOptions, MemoryStore};

    #[test]
    fn keys_are_prefixed_and_normalised() {
        let reg = Registry::new(
            Arc::new(MemoryStore::new()),
            "/_pf/",
            Duration::from_secs(1),
            "127.0.0.1:2379",
        );
        assert_eq!(reg.prefix(), "/_pf");
        assert_eq!(reg.key(&[PROCESS_DIR, "1-M-svc", OBJECT]), "/_pf/process/1-M-svc/object");
        assert_eq!(reg.endpoints(), "127.0.0.1:2379");
    }

    #[tokio::test(start_paused = true)]
    async fn slow_store_surfaces_as_unavailable() {
        let store = Arc::new(MemoryStore::new());
        store.set_latency(Duration::from_secs(5));
        let reg = Registry::new(store.clone(), "/_pf", Duration::from_millis(2500), "");

        let res = reg
            .call("read root", reg.store().get("/", GetOptions::quorum()))
            .await;
        assert!(matches!(res, Err(StoreError::Unavailable(_))));

        let err: Error = res.unwrap_err().into();
        assert_eq!(err.code(), "unavailable");
    }
}
