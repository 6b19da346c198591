// src/store/mod.rs

//! Pluggable key-value store backend.
//!
//! The registry talks to a `KvStore` instead of a concrete client. The store
//! model is a hierarchical namespace of directories and leaves with
//! etcd-v2-style conditional writes:
//! - `prev_exist` to create-only or update-only
//! - `prev_value` for compare-and-swap
//! - `ttl` / `refresh` for liveness keys
//! - recursive get and delete of whole subtrees
//! - watch streams over a key prefix
//!
//! [`EtcdStore`] talks to an etcd cluster over the v2 keys API and is what
//! the minion binary uses. [`MemoryStore`] keeps the same semantics in
//! process, for tests and single-host setups.

mod etcd;
mod memory;

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::broadcast;
use tracing::warn;

use crate::config::RegistryBackend;

pub use etcd::EtcdStore;
pub use memory::MemoryStore;

/// Boxed future returned by every backend call.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, StoreError>> + Send + 'a>>;

/// Backend error codes. The registry inspects these to decide which
/// failures are benign (a lost CAS race, a vanished node) and which surface
/// to callers.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("key not found: {0}")]
    KeyNotFound(String),

    #[error("key already exists: {0}")]
    NodeExists(String),

    #[error("compare failed on {key}: expected {expected:?}, found {actual:?}")]
    TestFailed {
        key: String,
        expected: String,
        actual: String,
    },

    #[error("not a file: {0}")]
    NotAFile(String),

    #[error("not a directory: {0}")]
    NotADir(String),

    #[error("directory not empty: {0}")]
    DirNotEmpty(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

impl From<StoreError> for crate::errors::Error {
    fn from(err: StoreError) -> Self {
        use crate::errors::Error;
        match err {
            StoreError::KeyNotFound(key) => Error::NotFound(key),
            StoreError::NodeExists(key) => Error::Conflict(format!("{key} already exists")),
            e @ StoreError::TestFailed { .. } => Error::Conflict(e.to_string()),
            e @ (StoreError::NotAFile(_) | StoreError::NotADir(_) | StoreError::DirNotEmpty(_)) => {
                Error::Corrupt(e.to_string())
            }
            StoreError::Unavailable(reason) => Error::Unavailable(reason),
        }
    }
}

/// One node of the namespace as returned by `get`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    /// Absolute, normalised key (`/a/b/c`).
    pub key: String,
    pub value: String,
    pub dir: bool,
    /// Children of a directory. Populated one level deep, or fully when the
    /// read was recursive.
    pub nodes: Vec<Node>,
    /// Remaining time to live, if the node has one.
    pub ttl: Option<Duration>,
    pub modified_index: u64,
}

impl Node {
    /// Last path segment of the key.
    pub fn base_name(&self) -> &str {
        base_name(&self.key)
    }

    /// Direct child with the given base name.
    pub fn child(&self, name: &str) -> Option<&Node> {
        self.nodes.iter().find(|n| n.base_name() == name)
    }
}

/// Existence precondition for `set`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum PrevExist {
    #[default]
    Ignore,
    MustExist,
    MustNotExist,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SetOptions {
    pub prev_exist: PrevExist,
    /// Compare-and-swap: the stored value must equal this.
    pub prev_value: Option<String>,
    pub ttl: Option<Duration>,
    /// Only reset the TTL; the stored value is kept.
    pub refresh: bool,
    /// Create a directory rather than a leaf.
    pub dir: bool,
}

impl SetOptions {
    /// Create-only write.
    pub fn create() -> Self {
        Self {
            prev_exist: PrevExist::MustNotExist,
            ..Self::default()
        }
    }

    /// Update-only write.
    pub fn update() -> Self {
        Self {
            prev_exist: PrevExist::MustExist,
            ..Self::default()
        }
    }

    /// Compare-and-swap against `prev`.
    pub fn cas(prev: impl Into<String>) -> Self {
        Self {
            prev_exist: PrevExist::MustExist,
            prev_value: Some(prev.into()),
            ..Self::default()
        }
    }

    /// Reset the TTL of an existing key without touching its value.
    pub fn refresh(ttl: Duration) -> Self {
        Self {
            prev_exist: PrevExist::MustExist,
            ttl: Some(ttl),
            refresh: true,
            ..Self::default()
        }
    }

    pub fn dir(mut self) -> Self {
        self.dir = true;
        self
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GetOptions {
    pub recursive: bool,
    /// Linearisable read. Always honoured by the in-memory backend.
    pub quorum: bool,
}

impl GetOptions {
    pub fn quorum() -> Self {
        Self {
            recursive: false,
            quorum: true,
        }
    }

    pub fn recursive() -> Self {
        Self {
            recursive: true,
            quorum: true,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeleteOptions {
    pub recursive: bool,
    pub dir: bool,
}

impl DeleteOptions {
    pub fn recursive() -> Self {
        Self {
            recursive: true,
            dir: true,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchAction {
    Create,
    Set,
    Update,
    CompareAndSwap,
    Delete,
    Expire,
}

/// A change notification delivered to watchers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub key: String,
    pub dir: bool,
    pub index: u64,
}

/// Backend for `backend`. The memory backend hands back `memory`, so its
/// state outlives the server that used it.
pub fn open_store(
    backend: RegistryBackend,
    endpoints: &[String],
    memory: &Arc<MemoryStore>,
) -> Result<Arc<dyn KvStore>, StoreError> {
    match backend {
        RegistryBackend::Etcd => Ok(Arc::new(EtcdStore::new(endpoints)?)),
        RegistryBackend::Memory => Ok(memory.clone()),
    }
}

/// Trait abstracting the consistent key-value store behind the registry.
pub trait KvStore: Send + Sync + fmt::Debug {
    fn get<'a>(&'a self, key: &'a str, opts: GetOptions) -> StoreFuture<'a, Node>;

    fn set<'a>(&'a self, key: &'a str, value: &'a str, opts: SetOptions) -> StoreFuture<'a, Node>;

    fn delete<'a>(&'a self, key: &'a str, opts: DeleteOptions) -> StoreFuture<'a, ()>;

    /// Subscribe to changes at or below `prefix`. Events that happen before
    /// the call are not replayed.
    fn watch(&self, prefix: &str) -> Watcher;
}

/// Stream of [`WatchEvent`]s filtered to one key prefix.
#[derive(Debug)]
pub struct Watcher {
    prefix: String,
    rx: broadcast::Receiver<WatchEvent>,
}

impl Watcher {
    pub fn new(prefix: &str, rx: broadcast::Receiver<WatchEvent>) -> Self {
        Self {
            prefix: normalize_key(prefix),
            rx,
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Wait for the next event under the prefix. Returns `None` once the
    /// store is gone.
    pub async fn next(&mut self) -> Option<WatchEvent> {
        loop {
            match self.rx.recv().await {
                Ok(ev) if is_at_or_below(&ev.key, &self.prefix) => return Some(ev),
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(prefix = %self.prefix, skipped, "watcher lagged; events dropped");
                    continue;
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

/// Normalise a key to `/seg/seg` form. The root is `/`.
pub fn normalize_key(key: &str) -> String {
    let segments: Vec<&str> = key.split('/').filter(|s| !s.is_empty()).collect();
    format!("/{}", segments.join("/"))
}

/// Join key segments, normalising the result.
pub fn join_key(parts: &[&str]) -> String {
    normalize_key(&parts.join("/"))
}

pub fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

pub(crate) fn is_at_or_below(key: &str, ancestor: &str) -> bool {
    if ancestor == "/" {
        return true;
    }
    key == ancestor
        || (key.len() > ancestor.len()
            && key.starts_with(ancestor)
            && key.as_bytes()[ancestor.len()] == b'/')
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_helpers() {
        assert_eq!(normalize_key("//a/b//c/"), "/a/b/c");
        assert_eq!(normalize_key(""), "/");
        assert_eq!(join_key(&["/_pf", "process", "1-M-svc"]), "/_pf/process/1-M-svc");
        assert_eq!(base_name("/_pf/job/process-state"), "process-state");
    }

    #[test]
    fn memory_backend_is_shared_across_opens() {
        let memory = Arc::new(MemoryStore::new());
        let a = open_store(RegistryBackend::Memory, &[], &memory).unwrap();
        let b = open_store(RegistryBackend::Memory, &[], &memory).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn etcd_backend_needs_an_endpoint() {
        let memory = Arc::new(MemoryStore::new());
        assert!(open_store(RegistryBackend::Etcd, &[], &memory).is_err());
        let store = open_store(RegistryBackend::Etcd, &["127.0.0.1:2379".to_string()], &memory);
        assert!(store.is_ok());
    }

    #[test]
    fn prefix_matching_respects_segment_boundaries() {
        assert!(is_at_or_below("/a/job/x", "/a/job"));
        assert!(is_at_or_below("/a/job", "/a/job"));
        assert!(!is_at_or_below("/a/jobs/x", "/a/job"));
        assert!(is_at_or_below("/anything", "/"));
    }
}
