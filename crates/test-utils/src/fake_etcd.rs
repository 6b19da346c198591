//! A small etcd v2 keys API server over a [`MemoryStore`].
//!
//! Enough of the protocol for `EtcdStore`: get/put/delete on `/v2/keys`,
//! etcd error bodies and `X-Etcd-Index`, and `wait=true` long polls. One
//! request per connection. Long polls only see changes made after the poll
//! arrived.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use procfleet::store::{
    DeleteOptions, GetOptions, KvStore, MemoryStore, Node, PrevExist, SetOptions, StoreError,
    WatchAction,
};
use serde_json::{Value, json};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

const LONG_POLL: Duration = Duration::from_secs(20);

#[derive(Debug)]
pub struct FakeEtcd {
    addr: SocketAddr,
    store: Arc<MemoryStore>,
    requests: Arc<Mutex<Vec<String>>>,
    task: JoinHandle<()>,
}

impl Drop for FakeEtcd {
    fn drop(&mut self) {
        self.task.abort();
    }
}

impl FakeEtcd {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("binding fake etcd");
        let addr = listener.local_addr().expect("fake etcd address");
        let store = Arc::new(MemoryStore::new());
        let requests = Arc::new(Mutex::new(Vec::new()));
        let task = tokio::spawn(serve(listener, store.clone(), requests.clone()));
        Self {
            addr,
            store,
            requests,
            task,
        }
    }

    /// `http://127.0.0.1:<port>`
    pub fn endpoint(&self) -> String {
        format!("http://{}", self.addr)
    }

    /// The state behind the API, for direct inspection.
    pub fn store(&self) -> &Arc<MemoryStore> {
        &self.store
    }

    /// `METHOD target` of every request served so far.
    pub fn requests(&self) -> Vec<String> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// An endpoint nobody listens on.
pub async fn dead_endpoint() -> String {
    let listener = TcpListener::bind("127.0.0.1:0")
        .await
        .expect("binding throwaway port");
    let addr = listener.local_addr().expect("throwaway address");
    drop(listener);
    format!("http://{addr}")
}

struct Request {
    method: String,
    target: String,
    key: String,
    query: HashMap<String, String>,
    form: HashMap<String, String>,
}

impl Request {
    fn flag(map: &HashMap<String, String>, name: &str) -> bool {
        map.get(name).is_some_and(|v| v == "true")
    }
}

async fn serve(listener: TcpListener, store: Arc<MemoryStore>, requests: Arc<Mutex<Vec<String>>>) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(handle(stream, store.clone(), requests.clone()));
    }
}

async fn handle(stream: TcpStream, store: Arc<MemoryStore>, requests: Arc<Mutex<Vec<String>>>) {
    let (read, mut write) = stream.into_split();
    let mut reader = BufReader::new(read);
    let Some(req) = read_request(&mut reader).await else {
        return;
    };
    requests
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .push(format!("{} {}", req.method, req.target));

    let (status, body) = respond(&store, &req).await;
    let response = format!(
        "HTTP/1.1 {status} {}\r\nContent-Type: application/json\r\nX-Etcd-Index: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
        reason(status),
        store.index(),
        body.len(),
    );
    let _ = write.write_all(response.as_bytes()).await;
    let _ = write.shutdown().await;
}

async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Option<Request> {
    let mut line = String::new();
    reader.read_line(&mut line).await.ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut content_length = 0usize;
    loop {
        let mut header = String::new();
        if reader.read_line(&mut header).await.ok()? == 0 {
            break;
        }
        let header = header.trim_end();
        if header.is_empty() {
            break;
        }
        if let Some((name, value)) = header.split_once(':') {
            if name.eq_ignore_ascii_case("content-length") {
                content_length = value.trim().parse().ok()?;
            }
        }
    }
    let mut body = vec![0; content_length];
    reader.read_exact(&mut body).await.ok()?;

    let (path, query) = target.split_once('?').unwrap_or((target.as_str(), ""));
    let key = decode(path.strip_prefix("/v2/keys").unwrap_or(path));
    let query = parse_pairs(query);
    let form = parse_pairs(&String::from_utf8_lossy(&body));
    Some(Request {
        method,
        target,
        key,
        query,
        form,
    })
}

async fn respond(store: &MemoryStore, req: &Request) -> (u16, String) {
    let result = match req.method.as_str() {
        "GET" if Request::flag(&req.query, "wait") => return wait_for_change(store, req).await,
        "GET" => {
            let opts = GetOptions {
                recursive: Request::flag(&req.query, "recursive"),
                quorum: Request::flag(&req.query, "quorum"),
            };
            store
                .get(&req.key, opts)
                .await
                .map(|node| (200, json!({"action": "get", "node": node_json(&node)})))
        }
        "PUT" => {
            let opts = set_options(&req.form);
            let (action, status) = if opts.prev_value.is_some() {
                ("compareAndSwap", 200)
            } else {
                match opts.prev_exist {
                    PrevExist::MustNotExist => ("create", 201),
                    PrevExist::MustExist => ("update", 200),
                    PrevExist::Ignore => ("set", 200),
                }
            };
            let value = req.form.get("value").cloned().unwrap_or_default();
            store
                .set(&req.key, &value, opts)
                .await
                .map(|node| (status, json!({"action": action, "node": node_json(&node)})))
        }
        "DELETE" => {
            let opts = DeleteOptions {
                recursive: Request::flag(&req.query, "recursive"),
                dir: Request::flag(&req.query, "dir"),
            };
            store
                .delete(&req.key, opts)
                .await
                .map(|()| (200, json!({"action": "delete", "node": {"key": req.key}})))
        }
        _ => return (405, String::new()),
    };

    match result {
        Ok((status, body)) => (status, body.to_string()),
        Err(err) => error_reply(&err),
    }
}

async fn wait_for_change(store: &MemoryStore, req: &Request) -> (u16, String) {
    let wait_index: u64 = req
        .query
        .get("waitIndex")
        .and_then(|v| v.parse().ok())
        .unwrap_or(0);
    let mut watcher = store.watch(&req.key);
    loop {
        match tokio::time::timeout(LONG_POLL, watcher.next()).await {
            Ok(Some(ev)) if ev.index >= wait_index => {
                let body = json!({
                    "action": action_name(ev.action),
                    "node": {"key": ev.key, "dir": ev.dir, "modifiedIndex": ev.index},
                });
                return (200, body.to_string());
            }
            Ok(Some(_)) => continue,
            // Empty answer: the client polls again.
            Ok(None) | Err(_) => return (200, String::new()),
        }
    }
}

fn set_options(form: &HashMap<String, String>) -> SetOptions {
    SetOptions {
        prev_exist: match form.get("prevExist").map(String::as_str) {
            Some("true") => PrevExist::MustExist,
            Some("false") => PrevExist::MustNotExist,
            _ => PrevExist::Ignore,
        },
        prev_value: form.get("prevValue").cloned(),
        ttl: form
            .get("ttl")
            .and_then(|t| t.parse().ok())
            .map(Duration::from_secs),
        refresh: Request::flag(form, "refresh"),
        dir: Request::flag(form, "dir"),
    }
}

fn node_json(node: &Node) -> Value {
    let mut v = json!({"key": node.key, "modifiedIndex": node.modified_index});
    if node.dir {
        v["dir"] = json!(true);
        if !node.nodes.is_empty() {
            v["nodes"] = Value::Array(node.nodes.iter().map(node_json).collect());
        }
    } else {
        v["value"] = json!(node.value);
    }
    if let Some(ttl) = node.ttl {
        v["ttl"] = json!(ttl.as_secs().max(1));
    }
    v
}

fn error_reply(err: &StoreError) -> (u16, String) {
    let (status, code, cause) = match err {
        StoreError::KeyNotFound(key) => (404, 100, key.clone()),
        StoreError::TestFailed {
            expected, actual, ..
        } => (412, 101, format!("[{expected} != {actual}]")),
        StoreError::NotAFile(key) => (403, 102, key.clone()),
        StoreError::NotADir(key) => (403, 104, key.clone()),
        StoreError::NodeExists(key) => (412, 105, key.clone()),
        StoreError::DirNotEmpty(key) => (403, 108, key.clone()),
        StoreError::Unavailable(reason) => (500, 300, reason.clone()),
    };
    let body = json!({"errorCode": code, "message": err.to_string(), "cause": cause, "index": 0});
    (status, body.to_string())
}

fn action_name(action: WatchAction) -> &'static str {
    match action {
        WatchAction::Create => "create",
        WatchAction::Set => "set",
        WatchAction::Update => "update",
        WatchAction::CompareAndSwap => "compareAndSwap",
        WatchAction::Delete => "delete",
        WatchAction::Expire => "expire",
    }
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        201 => "Created",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        412 => "Precondition Failed",
        _ => "Internal Server Error",
    }
}

fn parse_pairs(raw: &str) -> HashMap<String, String> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(k), decode(v))
        })
        .collect()
}

/// `application/x-www-form-urlencoded` decoding.
fn decode(raw: &str) -> String {
    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            b'%' if i + 2 < bytes.len() => {
                match std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|hex| u8::from_str_radix(hex, 16).ok())
                {
                    Some(b) => {
                        out.push(b);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}
