// src/store/etcd.rs

//! Client for the etcd v2 keys API.
//!
//! Requests go to `<endpoint>/v2/keys<key>`. When an endpoint cannot be
//! reached, the client tries the next one and remembers the first that
//! answers. etcd error bodies map onto [`StoreError`] codes. Each watcher
//! is fed by a background long poll (`wait=true&recursive=true`). The poll
//! ends once the watcher is dropped.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, trace, warn};

use super::{
    DeleteOptions, GetOptions, KvStore, Node, PrevExist, SetOptions, StoreError, StoreFuture,
    WatchAction, WatchEvent, Watcher, normalize_key,
};

const WATCH_BUFFER: usize = 256;
/// Upper bound of one long poll; the watcher re-polls after it.
const WATCH_POLL: Duration = Duration::from_secs(30);
const WATCH_RETRY: Duration = Duration::from_secs(1);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);
const INDEX_HEADER: &str = "x-etcd-index";

const KEY_NOT_FOUND: u32 = 100;
const TEST_FAILED: u32 = 101;
const NOT_A_FILE: u32 = 102;
const NOT_A_DIR: u32 = 104;
const NODE_EXISTS: u32 = 105;
const DIR_NOT_EMPTY: u32 = 108;
const EVENT_INDEX_CLEARED: u32 = 401;

/// etcd v2 backend shared by every registry client of the process.
#[derive(Debug, Clone)]
pub struct EtcdStore {
    transport: Arc<Transport>,
}

#[derive(Debug)]
struct Transport {
    client: Client,
    endpoints: Vec<String>,
    current: AtomicUsize,
}

enum SendError {
    TimedOut,
    Unreachable(String),
}

impl From<SendError> for StoreError {
    fn from(err: SendError) -> Self {
        match err {
            SendError::TimedOut => StoreError::Unavailable("registry request timed out".to_string()),
            SendError::Unreachable(reason) => StoreError::Unavailable(reason),
        }
    }
}

/// Raw answer: status, cluster index and body, before interpretation.
#[derive(Debug)]
struct Reply {
    status: StatusCode,
    index: Option<u64>,
    body: String,
}

#[derive(Debug, Deserialize)]
struct Envelope {
    action: String,
    node: Option<RawNode>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawNode {
    /// Absent on the root node.
    #[serde(default)]
    key: String,
    #[serde(default)]
    value: String,
    #[serde(default)]
    dir: bool,
    #[serde(default)]
    nodes: Vec<RawNode>,
    ttl: Option<i64>,
    #[serde(default)]
    modified_index: u64,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ErrorBody {
    error_code: u32,
    #[serde(default)]
    message: String,
    #[serde(default)]
    cause: String,
    #[serde(default)]
    index: u64,
}

impl From<RawNode> for Node {
    fn from(raw: RawNode) -> Self {
        Node {
            key: normalize_key(&raw.key),
            value: raw.value,
            dir: raw.dir,
            nodes: raw.nodes.into_iter().map(Node::from).collect(),
            ttl: raw
                .ttl
                .and_then(|t| u64::try_from(t).ok())
                .filter(|t| *t > 0)
                .map(Duration::from_secs),
            modified_index: raw.modified_index,
        }
    }
}

impl EtcdStore {
    /// Client over `endpoints` (`http://host:port`; a bare `host:port`
    /// is taken as plain http). Nothing is contacted until the first
    /// request.
    pub fn new(endpoints: &[String]) -> Result<Self, StoreError> {
        let endpoints: Vec<String> = endpoints
            .iter()
            .map(|e| e.trim().trim_end_matches('/'))
            .filter(|e| !e.is_empty())
            .map(|e| {
                if e.contains("://") {
                    e.to_string()
                } else {
                    format!("http://{e}")
                }
            })
            .collect();
        if endpoints.is_empty() {
            return Err(StoreError::Unavailable(
                "no registry endpoints configured".to_string(),
            ));
        }

        let client = Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .map_err(|e| StoreError::Unavailable(format!("building registry client: {e}")))?;

        Ok(Self {
            transport: Arc::new(Transport {
                client,
                endpoints,
                current: AtomicUsize::new(0),
            }),
        })
    }

    pub fn endpoints(&self) -> &[String] {
        &self.transport.endpoints
    }
}

impl Transport {
    /// Send the request built by `build`, starting at the endpoint that
    /// answered last and moving on while endpoints are unreachable.
    async fn send<F>(&self, build: F) -> Result<Reply, SendError>
    where
        F: Fn(&Client, &str) -> RequestBuilder,
    {
        let count = self.endpoints.len();
        let start = self.current.load(Ordering::Relaxed);
        let mut last_error = String::from("no endpoint answered");

        for step in 0..count {
            let i = (start + step) % count;
            let endpoint = &self.endpoints[i];
            match build(&self.client, endpoint).send().await {
                Ok(resp) => {
                    if step > 0 {
                        debug!(endpoint = %endpoint, "switched registry endpoint");
                        self.current.store(i, Ordering::Relaxed);
                    }
                    return Reply::read(resp).await;
                }
                Err(e) if e.is_timeout() => return Err(SendError::TimedOut),
                Err(e) => {
                    debug!(endpoint = %endpoint, error = %e, "registry endpoint unreachable");
                    last_error = format!("{endpoint}: {e}");
                }
            }
        }
        Err(SendError::Unreachable(last_error))
    }

    /// Current cluster index as seen through `key`, present or not.
    async fn current_index(&self, key: &str) -> Result<u64, StoreError> {
        let reply = self
            .send(|client, endpoint| client.get(keys_url(endpoint, key)))
            .await?;
        reply
            .index
            .or_else(|| {
                serde_json::from_str::<ErrorBody>(&reply.body)
                    .ok()
                    .map(|b| b.index)
            })
            .ok_or_else(|| StoreError::Unavailable("registry reply carries no index".to_string()))
    }
}

impl Reply {
    async fn read(resp: Response) -> Result<Self, SendError> {
        let status = resp.status();
        let index = resp
            .headers()
            .get(INDEX_HEADER)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse().ok());
        let body = resp.text().await.map_err(|e| {
            if e.is_timeout() {
                SendError::TimedOut
            } else {
                SendError::Unreachable(format!("reading registry reply: {e}"))
            }
        })?;
        Ok(Self {
            status,
            index,
            body,
        })
    }

    fn into_envelope(self, key: &str, expected: Option<&str>) -> Result<Envelope, StoreError> {
        if !self.status.is_success() {
            return Err(error_from_body(self.status, &self.body, key, expected));
        }
        serde_json::from_str(&self.body)
            .map_err(|e| StoreError::Unavailable(format!("malformed registry reply: {e}")))
    }

    fn into_node(self, key: &str, expected: Option<&str>) -> Result<Node, StoreError> {
        self.into_envelope(key, expected)?
            .node
            .map(Node::from)
            .ok_or_else(|| StoreError::Unavailable(format!("registry reply for {key} has no node")))
    }
}

fn keys_url(endpoint: &str, key: &str) -> String {
    format!("{endpoint}/v2/keys{key}")
}

fn flag(on: bool) -> &'static str {
    if on { "true" } else { "false" }
}

/// TTLs travel as whole seconds; round up so a short TTL never means "no TTL".
fn ttl_secs(ttl: Duration) -> u64 {
    (ttl.as_secs() + u64::from(ttl.subsec_nanos() > 0)).max(1)
}

fn get_query(opts: GetOptions) -> [(&'static str, &'static str); 3] {
    [
        ("recursive", flag(opts.recursive)),
        ("quorum", flag(opts.quorum)),
        ("sorted", "true"),
    ]
}

fn delete_query(opts: DeleteOptions) -> [(&'static str, &'static str); 2] {
    [("recursive", flag(opts.recursive)), ("dir", flag(opts.dir))]
}

fn set_form(value: &str, opts: &SetOptions) -> Vec<(&'static str, String)> {
    let mut form = Vec::new();
    if opts.dir {
        form.push(("dir", "true".to_string()));
    } else if !opts.refresh {
        form.push(("value", value.to_string()));
    }
    if let Some(ttl) = opts.ttl {
        form.push(("ttl", ttl_secs(ttl).to_string()));
    }
    if opts.refresh {
        form.push(("refresh", "true".to_string()));
    }
    match opts.prev_exist {
        PrevExist::Ignore => {}
        PrevExist::MustExist => form.push(("prevExist", "true".to_string())),
        PrevExist::MustNotExist => form.push(("prevExist", "false".to_string())),
    }
    if let Some(prev) = &opts.prev_value {
        form.push(("prevValue", prev.clone()));
    }
    form
}

fn error_from_body(status: StatusCode, body: &str, key: &str, expected: Option<&str>) -> StoreError {
    let Ok(err) = serde_json::from_str::<ErrorBody>(body) else {
        return StoreError::Unavailable(format!("registry answered {status}"));
    };
    let key = key.to_string();
    match err.error_code {
        KEY_NOT_FOUND => StoreError::KeyNotFound(key),
        TEST_FAILED => StoreError::TestFailed {
            key,
            expected: expected.unwrap_or_default().to_string(),
            actual: actual_from_cause(&err.cause),
        },
        NOT_A_FILE => StoreError::NotAFile(key),
        NOT_A_DIR => StoreError::NotADir(key),
        NODE_EXISTS => StoreError::NodeExists(key),
        DIR_NOT_EMPTY => StoreError::DirNotEmpty(key),
        code => StoreError::Unavailable(format!("etcd error {code}: {} ({})", err.message, err.cause)),
    }
}

/// etcd reports a failed compare as `[expected != actual]`.
fn actual_from_cause(cause: &str) -> String {
    cause
        .trim_start_matches('[')
        .trim_end_matches(']')
        .split_once(" != ")
        .map(|(_, actual)| actual.to_string())
        .unwrap_or_default()
}

fn watch_action(action: &str) -> Option<WatchAction> {
    match action {
        "create" => Some(WatchAction::Create),
        "set" => Some(WatchAction::Set),
        "update" => Some(WatchAction::Update),
        "compareAndSwap" => Some(WatchAction::CompareAndSwap),
        "delete" | "compareAndDelete" => Some(WatchAction::Delete),
        "expire" => Some(WatchAction::Expire),
        _ => None,
    }
}

impl KvStore for EtcdStore {
    fn get<'a>(&'a self, key: &'a str, opts: GetOptions) -> StoreFuture<'a, Node> {
        Box::pin(async move {
            let key = normalize_key(key);
            let query = get_query(opts);
            trace!(key = %key, ?opts, "etcd get");
            let reply = self
                .transport
                .send(|client, endpoint| client.get(keys_url(endpoint, &key)).query(&query))
                .await?;
            reply.into_node(&key, None)
        })
    }

    fn set<'a>(&'a self, key: &'a str, value: &'a str, opts: SetOptions) -> StoreFuture<'a, Node> {
        Box::pin(async move {
            let key = normalize_key(key);
            let form = set_form(value, &opts);
            trace!(key = %key, ?opts, "etcd set");
            let reply = self
                .transport
                .send(|client, endpoint| client.put(keys_url(endpoint, &key)).form(&form))
                .await?;
            reply.into_node(&key, opts.prev_value.as_deref())
        })
    }

    fn delete<'a>(&'a self, key: &'a str, opts: DeleteOptions) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let key = normalize_key(key);
            let query = delete_query(opts);
            trace!(key = %key, ?opts, "etcd delete");
            let reply = self
                .transport
                .send(|client, endpoint| client.delete(keys_url(endpoint, &key)).query(&query))
                .await?;
            reply.into_envelope(&key, None).map(|_| ())
        })
    }

    fn watch(&self, prefix: &str) -> Watcher {
        let (tx, rx) = broadcast::channel(WATCH_BUFFER);
        let watcher = Watcher::new(prefix, rx);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(watch_loop(
                    self.transport.clone(),
                    watcher.prefix().to_string(),
                    tx,
                ));
            }
            Err(_) => warn!(prefix, "no runtime to drive the registry watch; it stays silent"),
        }
        watcher
    }
}

/// Long-poll `prefix` and forward every change until the watcher is gone.
async fn watch_loop(transport: Arc<Transport>, prefix: String, tx: broadcast::Sender<WatchEvent>) {
    let mut next_index: Option<u64> = None;

    while tx.receiver_count() > 0 {
        let wait_index = match next_index {
            Some(index) => index,
            None => match transport.current_index(&prefix).await {
                Ok(index) => {
                    next_index = Some(index + 1);
                    continue;
                }
                Err(e) => {
                    warn!(prefix = %prefix, error = %e, "registry watch cannot sync; retrying");
                    tokio::time::sleep(WATCH_RETRY).await;
                    continue;
                }
            },
        };

        let wait_index = wait_index.to_string();
        let reply = transport
            .send(|client, endpoint| {
                client
                    .get(keys_url(endpoint, &prefix))
                    .query(&[
                        ("wait", "true"),
                        ("recursive", "true"),
                        ("waitIndex", wait_index.as_str()),
                    ])
                    .timeout(WATCH_POLL)
            })
            .await;

        let reply = match reply {
            Ok(reply) => reply,
            Err(SendError::TimedOut) => continue,
            Err(SendError::Unreachable(reason)) => {
                warn!(prefix = %prefix, reason = %reason, "registry watch failed; retrying");
                tokio::time::sleep(WATCH_RETRY).await;
                continue;
            }
        };

        if !reply.status.is_success() {
            match serde_json::from_str::<ErrorBody>(&reply.body) {
                Ok(err) if err.error_code == EVENT_INDEX_CLEARED => {
                    debug!(prefix = %prefix, "watch index compacted away; resyncing");
                    next_index = None;
                }
                // Prefix not created yet: wait for the first write below it.
                Ok(err) if err.error_code == KEY_NOT_FOUND => {
                    tokio::time::sleep(WATCH_RETRY).await;
                    next_index = None;
                }
                _ => {
                    warn!(prefix = %prefix, status = %reply.status, "registry watch rejected; retrying");
                    tokio::time::sleep(WATCH_RETRY).await;
                }
            }
            continue;
        }
        if reply.body.trim().is_empty() {
            continue;
        }

        let envelope: Envelope = match serde_json::from_str(&reply.body) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(prefix = %prefix, error = %e, "malformed watch reply; resyncing");
                next_index = None;
                continue;
            }
        };
        let Some(node) = envelope.node else {
            continue;
        };
        next_index = Some(node.modified_index + 1);

        if let Some(action) = watch_action(&envelope.action) {
            // No receivers left is handled by the loop condition.
            let _ = tx.send(WatchEvent {
                action,
                key: normalize_key(&node.key),
                dir: node.dir,
                index: node.modified_index,
            });
        }
    }
    trace!(prefix = %prefix, "registry watch closed");
}
