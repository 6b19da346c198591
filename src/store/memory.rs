// src/store/memory.rs

//! In-process, strongly consistent store with etcd-v2 semantics.
//!
//! All state lives behind one mutex, so every operation is linearisable.
//! TTLs are enforced lazily: expired keys are purged (and `Expire` events
//! emitted) at the start of the next operation. Deadlines use
//! `tokio::time::Instant`, so paused-clock tests can fast-forward expiry.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::trace;

use super::{
    DeleteOptions, GetOptions, KvStore, Node, PrevExist, SetOptions, StoreError, StoreFuture,
    WatchAction, WatchEvent, Watcher, is_at_or_below, normalize_key,
};

const WATCH_BUFFER: usize = 1024;

#[derive(Debug)]
pub struct MemoryStore {
    tree: Mutex<Tree>,
    events: broadcast::Sender<WatchEvent>,
    offline: AtomicBool,
    latency_ms: AtomicU64,
}

#[derive(Debug, Default)]
struct Tree {
    entries: BTreeMap<String, Entry>,
    index: u64,
}

#[derive(Debug, Clone)]
struct Entry {
    /// `None` marks a directory.
    value: Option<String>,
    expires_at: Option<Instant>,
    modified_index: u64,
}

impl Entry {
    fn is_dir(&self) -> bool {
        self.value.is_none()
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(WATCH_BUFFER);
        Self {
            tree: Mutex::new(Tree::default()),
            events,
            offline: AtomicBool::new(false),
            latency_ms: AtomicU64::new(0),
        }
    }

    /// Make every subsequent request fail with `Unavailable` until switched
    /// back. Used to exercise outage handling.
    pub fn set_offline(&self, offline: bool) {
        self.offline.store(offline, Ordering::SeqCst);
    }

    /// Delay every request by `latency`, emulating a slow cluster.
    pub fn set_latency(&self, latency: Duration) {
        let ms = u64::try_from(latency.as_millis()).unwrap_or(u64::MAX);
        self.latency_ms.store(ms, Ordering::SeqCst);
    }

    /// Number of live keys, directories included.
    pub fn len(&self) -> usize {
        let mut tree = self.tree.lock();
        self.purge_expired(&mut tree);
        tree.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Index of the most recent change, as etcd reports in `X-Etcd-Index`.
    pub fn index(&self) -> u64 {
        let mut tree = self.tree.lock();
        self.purge_expired(&mut tree);
        tree.index
    }

    async fn before_request(&self) -> Result<(), StoreError> {
        let latency = self.latency_ms.load(Ordering::SeqCst);
        if latency > 0 {
            tokio::time::sleep(Duration::from_millis(latency)).await;
        }
        if self.offline.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("store is offline".to_string()));
        }
        Ok(())
    }

    fn emit(&self, action: WatchAction, key: &str, dir: bool, index: u64) {
        trace!(?action, key, index, "store event");
        // No receivers is fine.
        let _ = self.events.send(WatchEvent {
            action,
            key: key.to_string(),
            dir,
            index,
        });
    }

    fn purge_expired(&self, tree: &mut Tree) {
        let now = Instant::now();
        let expired: Vec<String> = tree
            .entries
            .iter()
            .filter(|(_, e)| e.expires_at.is_some_and(|at| at <= now))
            .map(|(k, _)| k.clone())
            .collect();

        for key in expired {
            let Some(entry) = tree.entries.get(&key).cloned() else {
                // Already removed together with an expired ancestor.
                continue;
            };
            remove_subtree(tree, &key);
            tree.index += 1;
            self.emit(WatchAction::Expire, &key, entry.is_dir(), tree.index);
        }
    }

    fn get_sync(&self, key: &str, opts: GetOptions) -> Result<Node, StoreError> {
        let key = normalize_key(key);
        let mut tree = self.tree.lock();
        self.purge_expired(&mut tree);

        if key == "/" {
            return Ok(Node {
                key: key.clone(),
                value: String::new(),
                dir: true,
                nodes: build_children(&tree, &key, opts.recursive),
                ttl: None,
                modified_index: tree.index,
            });
        }

        let entry = tree
            .entries
            .get(&key)
            .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
        Ok(build_node(&tree, &key, entry, true, opts.recursive))
    }

    fn set_sync(&self, key: &str, value: &str, opts: SetOptions) -> Result<Node, StoreError> {
        let key = normalize_key(key);
        if key == "/" {
            return Err(StoreError::NotAFile(key));
        }

        let mut tree = self.tree.lock();
        self.purge_expired(&mut tree);

        let existing = tree.entries.get(&key).cloned();

        match (opts.prev_exist, &existing) {
            (PrevExist::MustNotExist, Some(_)) => return Err(StoreError::NodeExists(key)),
            (PrevExist::MustExist, None) => return Err(StoreError::KeyNotFound(key)),
            _ => {}
        }

        if let Some(expected) = &opts.prev_value {
            let current = existing
                .as_ref()
                .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
            let Some(actual) = &current.value else {
                return Err(StoreError::NotAFile(key));
            };
            if actual != expected {
                return Err(StoreError::TestFailed {
                    key,
                    expected: expected.clone(),
                    actual: actual.clone(),
                });
            }
        }

        let now = Instant::now();
        let expires_at = opts.ttl.map(|ttl| now + ttl);

        if opts.refresh {
            let Some(mut entry) = existing else {
                return Err(StoreError::KeyNotFound(key));
            };
            tree.index += 1;
            entry.expires_at = expires_at;
            entry.modified_index = tree.index;
            let index = tree.index;
            let node = build_node(&tree, &key, &entry, false, false);
            let dir = entry.is_dir();
            tree.entries.insert(key.clone(), entry);
            self.emit(WatchAction::Update, &key, dir, index);
            return Ok(node);
        }

        match &existing {
            Some(entry) if entry.is_dir() && !opts.dir => {
                return Err(StoreError::NotAFile(key));
            }
            Some(entry) if !entry.is_dir() && opts.dir => {
                return Err(StoreError::NotADir(key));
            }
            _ => {}
        }

        let missing_parents = check_parents(&tree, &key)?;
        tree.index += 1;
        let index = tree.index;
        for parent in missing_parents {
            tree.entries.insert(
                parent,
                Entry {
                    value: None,
                    expires_at: None,
                    modified_index: index,
                },
            );
        }

        let entry = Entry {
            value: if opts.dir { None } else { Some(value.to_string()) },
            expires_at,
            modified_index: index,
        };
        let node = build_node(&tree, &key, &entry, false, false);
        tree.entries.insert(key.clone(), entry);

        let action = if opts.prev_value.is_some() {
            WatchAction::CompareAndSwap
        } else if existing.is_none() {
            WatchAction::Create
        } else if opts.prev_exist == PrevExist::MustExist {
            WatchAction::Update
        } else {
            WatchAction::Set
        };
        self.emit(action, &key, opts.dir, index);

        Ok(node)
    }

    fn delete_sync(&self, key: &str, opts: DeleteOptions) -> Result<(), StoreError> {
        let key = normalize_key(key);
        if key == "/" {
            return Err(StoreError::NotAFile(key));
        }

        let mut tree = self.tree.lock();
        self.purge_expired(&mut tree);

        let entry = tree
            .entries
            .get(&key)
            .ok_or_else(|| StoreError::KeyNotFound(key.clone()))?;
        let dir = entry.is_dir();

        if dir {
            if !(opts.dir || opts.recursive) {
                return Err(StoreError::NotAFile(key));
            }
            if !opts.recursive && has_children(&tree, &key) {
                return Err(StoreError::DirNotEmpty(key));
            }
        }

        remove_subtree(&mut tree, &key);
        tree.index += 1;
        let index = tree.index;
        self.emit(WatchAction::Delete, &key, dir, index);
        Ok(())
    }
}

impl KvStore for MemoryStore {
    fn get<'a>(&'a self, key: &'a str, opts: GetOptions) -> StoreFuture<'a, Node> {
        Box::pin(async move {
            self.before_request().await?;
            self.get_sync(key, opts)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, opts: SetOptions) -> StoreFuture<'a, Node> {
        Box::pin(async move {
            self.before_request().await?;
            self.set_sync(key, value, opts)
        })
    }

    fn delete<'a>(&'a self, key: &'a str, opts: DeleteOptions) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.before_request().await?;
            self.delete_sync(key, opts)
        })
    }

    fn watch(&self, prefix: &str) -> Watcher {
        Watcher::new(prefix, self.events.subscribe())
    }
}

/// Ancestors of `key` that must be created as directories. Fails if any
/// ancestor is a leaf.
fn check_parents(tree: &Tree, key: &str) -> Result<Vec<String>, StoreError> {
    let mut missing = Vec::new();
    let mut current = key;
    while let Some((parent, _)) = current.rsplit_once('/') {
        if parent.is_empty() {
            break;
        }
        match tree.entries.get(parent) {
            Some(entry) if !entry.is_dir() => {
                return Err(StoreError::NotADir(parent.to_string()));
            }
            Some(_) => {}
            None => missing.push(parent.to_string()),
        }
        current = parent;
    }
    Ok(missing)
}

fn child_keys<'t>(tree: &'t Tree, dir: &str) -> impl Iterator<Item = &'t String> + 't {
    let start = if dir == "/" {
        "/".to_string()
    } else {
        format!("{dir}/")
    };
    let offset = start.len();
    tree.entries
        .range(start.clone()..)
        .map(|(k, _)| k)
        .take_while(move |k| k.starts_with(&start))
        .filter(move |k| !k[offset..].contains('/'))
}

fn has_children(tree: &Tree, dir: &str) -> bool {
    child_keys(tree, dir).next().is_some()
}

fn build_children(tree: &Tree, dir: &str, recursive: bool) -> Vec<Node> {
    child_keys(tree, dir)
        .filter_map(|k| tree.entries.get(k).map(|e| (k, e)))
        .map(|(k, e)| build_node(tree, k, e, recursive, recursive))
        .collect()
}

fn build_node(tree: &Tree, key: &str, entry: &Entry, list_children: bool, recursive: bool) -> Node {
    let now = Instant::now();
    Node {
        key: key.to_string(),
        value: entry.value.clone().unwrap_or_default(),
        dir: entry.is_dir(),
        nodes: if entry.is_dir() && list_children {
            build_children(tree, key, recursive)
        } else {
            Vec::new()
        },
        ttl: entry.expires_at.map(|at| at.saturating_duration_since(now)),
        modified_index: entry.modified_index,
    }
}

fn remove_subtree(tree: &mut Tree, key: &str) {
    tree.entries.retain(|k, _| !is_at_or_below(k, key));
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> MemoryStore {
        MemoryStore::new()
    }

    #[tokio::test]
    async fn set_creates_parent_directories() {
        let s = store();
        s.set("/a/b/c", "v", SetOptions::default()).await.unwrap();

        let a = s.get("/a", GetOptions::recursive()).await.unwrap();
        assert!(a.dir);
        let b = a.child("b").unwrap();
        assert!(b.dir);
        assert_eq!(b.child("c").unwrap().value, "v");
    }

    #[tokio::test]
    async fn create_only_and_update_only() {
        let s = store();
        s.set("/k", "1", SetOptions::create()).await.unwrap();
        assert_eq!(
            s.set("/k", "2", SetOptions::create()).await,
            Err(StoreError::NodeExists("/k".into()))
        );
        assert_eq!(
            s.set("/missing", "2", SetOptions::update()).await,
            Err(StoreError::KeyNotFound("/missing".into()))
        );
    }

    #[tokio::test]
    async fn compare_and_swap() {
        let s = store();
        s.set("/n", "10000", SetOptions::default()).await.unwrap();
        s.set("/n", "10001", SetOptions::cas("10000")).await.unwrap();
        let err = s.set("/n", "10001", SetOptions::cas("10000")).await.unwrap_err();
        assert!(matches!(err, StoreError::TestFailed { ref actual, .. } if actual == "10001"));
        assert_eq!(s.get("/n", GetOptions::quorum()).await.unwrap().value, "10001");
    }

    #[tokio::test]
    async fn leaf_and_directory_conflicts() {
        let s = store();
        s.set("/leaf", "x", SetOptions::default()).await.unwrap();
        assert_eq!(
            s.set("/leaf/child", "y", SetOptions::default()).await,
            Err(StoreError::NotADir("/leaf".into()))
        );

        s.set("/dir", "", SetOptions::default().dir()).await.unwrap();
        assert_eq!(
            s.set("/dir", "y", SetOptions::default()).await,
            Err(StoreError::NotAFile("/dir".into()))
        );
    }

    #[tokio::test]
    async fn delete_rules() {
        let s = store();
        s.set("/d/x", "1", SetOptions::default()).await.unwrap();

        assert_eq!(
            s.delete("/d", DeleteOptions::default()).await,
            Err(StoreError::NotAFile("/d".into()))
        );
        assert_eq!(
            s.delete("/d", DeleteOptions { recursive: false, dir: true }).await,
            Err(StoreError::DirNotEmpty("/d".into()))
        );
        s.delete("/d", DeleteOptions::recursive()).await.unwrap();
        assert!(s.is_empty());
        assert_eq!(
            s.delete("/d", DeleteOptions::recursive()).await,
            Err(StoreError::KeyNotFound("/d".into()))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn ttl_keys_expire_and_refresh() {
        let s = store();
        s.set("/m/alive", "", SetOptions::default().with_ttl(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        s.set("/m/alive", "", SetOptions::refresh(Duration::from_secs(10)))
            .await
            .unwrap();

        tokio::time::advance(Duration::from_secs(6)).await;
        let node = s.get("/m/alive", GetOptions::quorum()).await.unwrap();
        assert_eq!(node.ttl, Some(Duration::from_secs(4)));

        tokio::time::advance(Duration::from_secs(5)).await;
        assert!(matches!(
            s.get("/m/alive", GetOptions::quorum()).await,
            Err(StoreError::KeyNotFound(_))
        ));
        // The parent directory has no TTL and survives.
        assert!(s.get("/m", GetOptions::quorum()).await.is_ok());
    }

    #[tokio::test]
    async fn refresh_requires_existing_key() {
        let s = store();
        assert!(matches!(
            s.set("/x", "", SetOptions::refresh(Duration::from_secs(1))).await,
            Err(StoreError::KeyNotFound(_))
        ));
    }

    #[tokio::test]
    async fn non_recursive_get_lists_one_level() {
        let s = store();
        s.set("/p/a/x", "1", SetOptions::default()).await.unwrap();
        s.set("/p/b", "2", SetOptions::default()).await.unwrap();

        let p = s.get("/p", GetOptions::quorum()).await.unwrap();
        assert_eq!(p.nodes.len(), 2);
        assert!(p.child("a").unwrap().nodes.is_empty());
        assert_eq!(p.child("b").unwrap().value, "2");
    }

    #[tokio::test]
    async fn watcher_sees_only_its_prefix() {
        let s = store();
        let mut w = s.watch("/pf/job");

        s.set("/pf/process/1", "x", SetOptions::default()).await.unwrap();
        s.set("/pf/job/process-state", "1", SetOptions::default()).await.unwrap();

        let ev = w.next().await.unwrap();
        assert_eq!(ev.key, "/pf/job/process-state");
        assert_eq!(ev.action, WatchAction::Create);
        assert!(!ev.dir);
    }

    #[tokio::test]
    async fn offline_store_reports_unavailable() {
        let s = store();
        s.set_offline(true);
        assert!(matches!(
            s.get("/", GetOptions::quorum()).await,
            Err(StoreError::Unavailable(_))
        ));
        s.set_offline(false);
        assert!(s.get("/", GetOptions::quorum()).await.is_ok());
    }
}
