// src/registry/bootstrap.rs

use tracing::{info, warn};

use super::{
    BOOTSTRAPPED_KEY, BOOTSTRAPPED_VALUE, FIRST_PROC_ID, JOB_DIR, MACHINE_DIR, MAX_PROC_ID_KEY,
    PROCESS_DIR, Registry,
};
use crate::errors::{Error, Result};
use crate::store::{DeleteOptions, GetOptions, SetOptions, StoreError};

impl Registry {
    /// Lay out the top-level schema and seed the process ID counter.
    ///
    /// **Destructive.** Each of `process/`, `machine/`, `job/`,
    /// `max-process-id` and `bootstrapped` is created; if a node already
    /// exists at one of those paths it is deleted (recursively) and
    /// recreated. Running this against a populated registry discards every
    /// process, machine and the counter. Calling it on an empty registry is
    /// idempotent. Callers should gate it on [`Registry::is_bootstrapped`].
    pub async fn bootstrap(&self) -> Result<()> {
        for dir in [PROCESS_DIR, MACHINE_DIR, JOB_DIR] {
            self.must_create(&self.key(&[dir]), "", true).await?;
        }
        self.must_create(
            &self.key(&[MAX_PROC_ID_KEY]),
            &FIRST_PROC_ID.to_string(),
            false,
        )
        .await?;
        self.must_create(&self.key(&[BOOTSTRAPPED_KEY]), BOOTSTRAPPED_VALUE, false)
            .await?;

        info!(prefix = %self.prefix(), first_proc_id = FIRST_PROC_ID, "registry bootstrapped");
        Ok(())
    }

    /// Quorum read of the bootstrap marker.
    ///
    /// - marker absent: `Ok(false)`
    /// - marker is a directory: `Error::Bootstrap`
    /// - any other failure is returned as-is
    pub async fn is_bootstrapped(&self) -> Result<bool> {
        let key = self.key(&[BOOTSTRAPPED_KEY]);
        match self
            .call("read bootstrap marker", self.store.get(&key, GetOptions::quorum()))
            .await
        {
            Ok(node) if node.dir => Err(Error::Bootstrap(format!(
                "{key} is a directory, expected the bootstrap marker"
            ))),
            Ok(_) => Ok(true),
            Err(StoreError::KeyNotFound(_)) => {
                warn!(prefix = %self.prefix(), "registry not bootstrapped yet");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn must_create(&self, key: &str, value: &str, dir: bool) -> Result<()> {
        let opts = if dir {
            SetOptions::create().dir()
        } else {
            SetOptions::create()
        };

        match self.call("create node", self.store.set(key, value, opts.clone())).await {
            Ok(_) => return Ok(()),
            Err(StoreError::NodeExists(_)) => {
                warn!(key, "node already exists; deleting it and recreating");
            }
            Err(e) => return Err(e.into()),
        }

        match self
            .call("delete node", self.store.delete(key, DeleteOptions::recursive()))
            .await
        {
            Ok(()) | Err(StoreError::KeyNotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        self.call("recreate node", self.store.set(key, value, opts))
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;
    use crate::store::{KvStore, MemoryStore};

    fn registry(store: Arc<MemoryStore>) -> Registry {
        Registry::new(store, "/_pf", Duration::from_secs(1), "127.0.0.1:2379")
    }

    #[tokio::test]
    async fn fresh_registry_is_not_bootstrapped() {
        let reg = registry(Arc::new(MemoryStore::new()));
        assert!(!reg.is_bootstrapped().await.unwrap());

        reg.bootstrap().await.unwrap();
        assert!(reg.is_bootstrapped().await.unwrap());
    }

    #[tokio::test]
    async fn bootstrap_discards_existing_state() {
        let store = Arc::new(MemoryStore::new());
        let reg = registry(store.clone());
        reg.bootstrap().await.unwrap();

        store
            .set("/_pf/max-process-id", "10042", SetOptions::default())
            .await
            .unwrap();
        store
            .set("/_pf/process/10041-M-svc/object", "{}", SetOptions::default())
            .await
            .unwrap();

        reg.bootstrap().await.unwrap();

        let counter = store
            .get("/_pf/max-process-id", GetOptions::quorum())
            .await
            .unwrap();
        assert_eq!(counter.value, "10000");
        let procs = store.get("/_pf/process", GetOptions::recursive()).await.unwrap();
        assert!(procs.nodes.is_empty());
    }

    #[tokio::test]
    async fn directory_marker_is_a_bootstrap_violation() {
        let store = Arc::new(MemoryStore::new());
        store
            .set("/_pf/bootstrapped", "", SetOptions::default().dir())
            .await
            .unwrap();
        let err = registry(store).is_bootstrapped().await.unwrap_err();
        assert!(err.is_fatal());
    }
}
