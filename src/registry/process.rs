// src/registry/process.rs

use std::time::Duration;

use tracing::{debug, info, warn};

use super::{
    ALIVE, CURRENT_STATE, DESIRED_STATE, MAX_PROC_ID_KEY, OBJECT, PROCESS_DIR, Registry,
};
use crate::errors::{Error, Result};
use crate::model::{ProcessRunInfo, ProcessStatus, process_key};
use crate::store::{DeleteOptions, GetOptions, Node, SetOptions, StoreError, join_key};
use crate::types::ProcessState;

impl Registry {
    /// Allocate the next cluster-wide process ID.
    ///
    /// Reads `max-process-id`, then compare-and-swaps it to value + 1 and
    /// returns the value it read. Lost races back off exponentially and
    /// retry, up to the configured attempt cap (`Error::Conflict` after
    /// that). A missing or non-numeric counter is a bootstrap violation.
    pub async fn generate_proc_id(&self) -> Result<String> {
        let key = self.key(&[MAX_PROC_ID_KEY]);
        let retry = self.id_retry;

        for attempt in 0..retry.max_attempts {
            let node = match self
                .call("read process id counter", self.store.get(&key, GetOptions::quorum()))
                .await
            {
                Ok(node) => node,
                Err(StoreError::KeyNotFound(_)) => {
                    return Err(Error::Bootstrap(format!("{key} is missing")));
                }
                Err(e) => return Err(e.into()),
            };

            let current: u64 = node.value.trim().parse().map_err(|_| {
                Error::Bootstrap(format!("{key} holds non-numeric value {:?}", node.value))
            })?;
            let next = current
                .checked_add(1)
                .ok_or_else(|| Error::Bootstrap(format!("{key} overflowed")))?
                .to_string();

            match self
                .call(
                    "advance process id counter",
                    self.store.set(&key, &next, SetOptions::cas(node.value.clone())),
                )
                .await
            {
                Ok(_) => {
                    debug!(proc_id = current, attempt, "allocated process id");
                    return Ok(current.to_string());
                }
                Err(StoreError::TestFailed { .. }) => {
                    let delay = retry.backoff.next(attempt);
                    debug!(attempt, ?delay, "process id counter moved; retrying");
                    tokio::time::sleep(delay).await;
                }
                Err(StoreError::KeyNotFound(_)) => {
                    return Err(Error::Bootstrap(format!("{key} vanished during allocation")));
                }
                Err(e) => return Err(e.into()),
            }
        }

        Err(Error::Conflict(format!(
            "gave up allocating a process id after {} attempts",
            retry.max_attempts
        )))
    }

    /// Register a new placement. Returns the allocated process ID.
    ///
    /// The subtree starts with `desired-state = StateStarted` and
    /// `current-state = StateStopped`. If a write fails after the process
    /// directory was created, the directory is removed again; the consumed
    /// ID is simply skipped.
    pub async fn new_process(
        &self,
        mach_id: &str,
        svc_name: &str,
        run_info: &ProcessRunInfo,
    ) -> Result<String> {
        let object = serde_json::to_string(run_info)?;
        let proc_id = self.generate_proc_id().await?;
        let dir = self.key(&[PROCESS_DIR, &process_key(&proc_id, mach_id, svc_name)]);

        self.call("create process dir", self.store.set(&dir, "", SetOptions::create().dir()))
            .await?;

        if let Err(err) = self.populate_process(&dir, &object).await {
            warn!(proc_id = %proc_id, error = %err, "new process incomplete; removing its node");
            if let Err(cleanup) = self
                .call("remove incomplete process", self.store.delete(&dir, DeleteOptions::recursive()))
                .await
            {
                warn!(proc_id = %proc_id, error = %cleanup, "failed to remove incomplete process node");
            }
            return Err(err);
        }

        info!(proc_id = %proc_id, mach_id, svc = svc_name, "registered new process");
        Ok(proc_id)
    }

    async fn populate_process(&self, dir: &str, object: &str) -> Result<()> {
        let writes = [
            (DESIRED_STATE, ProcessState::Started.as_str()),
            (CURRENT_STATE, ProcessState::Stopped.as_str()),
            (OBJECT, object),
        ];
        for (leaf, value) in writes {
            let key = join_key(&[dir, leaf]);
            self.call("write process field", self.store.set(&key, value, SetOptions::create()))
                .await?;
        }
        Ok(())
    }

    /// Remove a process subtree. Returns the status it had.
    pub async fn delete_process(&self, proc_id: &str) -> Result<ProcessStatus> {
        let status = self.process(proc_id).await?;
        let dir = self.key(&[PROCESS_DIR, &status.key()]);
        self.call("delete process", self.store.delete(&dir, DeleteOptions::recursive()))
            .await?;
        info!(proc_id, mach_id = %status.mach_id, svc = %status.svc_name, "deleted process");
        Ok(status)
    }

    /// Overwrite `desired-state`. Fails with `NotFound` when the process
    /// does not exist.
    pub async fn update_process_desired_state(
        &self,
        proc_id: &str,
        state: ProcessState,
    ) -> Result<()> {
        let status = self.process(proc_id).await?;
        let key = self.key(&[PROCESS_DIR, &status.key(), DESIRED_STATE]);
        self.call(
            "write desired state",
            self.store.set(&key, state.as_str(), SetOptions::update()),
        )
        .await?;
        info!(proc_id, %state, "updated desired state");
        Ok(())
    }

    /// Publish the locally observed state of a process.
    ///
    /// 1. `current-state` is compare-and-swapped from `state.opposite()`. A
    ///    failed compare means the value is already `state` and is not an
    ///    error. A vanished process node makes the whole call a no-op.
    /// 2. If `is_alive`, the `alive` TTL key is refreshed or created;
    ///    otherwise it is deleted (already absent is fine).
    pub async fn update_process_state(
        &self,
        proc_id: &str,
        mach_id: &str,
        svc_name: &str,
        state: ProcessState,
        is_alive: bool,
        ttl: Duration,
    ) -> Result<()> {
        let dir = self.key(&[PROCESS_DIR, &process_key(proc_id, mach_id, svc_name)]);
        let current_key = join_key(&[&dir, CURRENT_STATE]);

        match self
            .call(
                "publish current state",
                self.store.set(
                    &current_key,
                    state.as_str(),
                    SetOptions::cas(state.opposite().as_str()),
                ),
            )
            .await
        {
            Ok(_) => debug!(proc_id, %state, "published current state"),
            Err(StoreError::TestFailed { actual, .. }) => {
                debug!(proc_id, %state, stored = %actual, "current state already published");
            }
            Err(StoreError::KeyNotFound(_)) => {
                debug!(proc_id, "process node vanished; nothing to publish");
                return Ok(());
            }
            Err(e) => return Err(e.into()),
        }

        let alive_key = join_key(&[&dir, ALIVE]);
        if is_alive {
            self.refresh_or_create_alive(&alive_key, ttl).await
        } else {
            match self
                .call("clear alive key", self.store.delete(&alive_key, DeleteOptions::default()))
                .await
            {
                Ok(()) | Err(StoreError::KeyNotFound(_)) => Ok(()),
                Err(e) => Err(e.into()),
            }
        }
    }

    /// Every process in the cluster, ordered by process ID.
    ///
    /// All-or-nothing: one malformed entry fails the whole read.
    pub async fn processes(&self) -> Result<Vec<ProcessStatus>> {
        let dir = self.key(&[PROCESS_DIR]);
        let root = match self
            .call("read processes", self.store.get(&dir, GetOptions::recursive()))
            .await
        {
            Ok(node) => node,
            Err(StoreError::KeyNotFound(_)) => {
                return Err(Error::Bootstrap(format!("{dir} is missing")));
            }
            Err(e) => return Err(e.into()),
        };

        let mut out = root
            .nodes
            .iter()
            .map(process_status_from_node)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| compare_proc_ids(&a.proc_id, &b.proc_id));
        Ok(out)
    }

    /// One process by ID.
    pub async fn process(&self, proc_id: &str) -> Result<ProcessStatus> {
        self.processes()
            .await?
            .into_iter()
            .find(|p| p.proc_id == proc_id)
            .ok_or_else(|| Error::NotFound(format!("process {proc_id}")))
    }

    pub async fn processes_on_machine(&self, mach_id: &str) -> Result<Vec<ProcessStatus>> {
        let mut all = self.processes().await?;
        all.retain(|p| p.mach_id == mach_id);
        Ok(all)
    }

    pub async fn processes_of_service(&self, svc_name: &str) -> Result<Vec<ProcessStatus>> {
        let mut all = self.processes().await?;
        all.retain(|p| p.svc_name == svc_name);
        Ok(all)
    }
}

/// Split `{procID}-{machID}-{svcName}`. The service name may itself contain
/// dashes; the process and machine IDs may not.
pub(crate) fn parse_process_key(name: &str) -> Result<(String, String, String)> {
    let mut parts = name.splitn(3, '-');
    match (parts.next(), parts.next(), parts.next()) {
        (Some(proc_id), Some(mach_id), Some(svc))
            if !proc_id.is_empty() && !mach_id.is_empty() && !svc.is_empty() =>
        {
            Ok((proc_id.to_string(), mach_id.to_string(), svc.to_string()))
        }
        _ => Err(Error::Corrupt(format!(
            "process key {name:?} is not of the form procID-machID-svcName"
        ))),
    }
}

fn process_status_from_node(node: &Node) -> Result<ProcessStatus> {
    if !node.dir {
        return Err(Error::Corrupt(format!("{} is not a process directory", node.key)));
    }
    let (proc_id, mach_id, svc_name) = parse_process_key(node.base_name())?;

    let desired_state = state_leaf(node, DESIRED_STATE)?;
    let current_state = state_leaf(node, CURRENT_STATE)?;
    let run_info = match node.child(OBJECT) {
        Some(obj) => serde_json::from_str(&obj.value).map_err(|e| {
            Error::Corrupt(format!("{}: invalid run info: {e}", obj.key))
        })?,
        None => ProcessRunInfo::default(),
    };

    Ok(ProcessStatus {
        proc_id,
        svc_name,
        mach_id,
        desired_state,
        current_state,
        is_alive: node.child(ALIVE).is_some(),
        run_info,
    })
}

/// A missing state leaf reads as stopped; an unparseable one is corrupt.
fn state_leaf(node: &Node, leaf: &str) -> Result<ProcessState> {
    match node.child(leaf) {
        Some(n) => n
            .value
            .parse()
            .map_err(|e: String| Error::Corrupt(format!("{}: {e}", n.key))),
        None => Ok(ProcessState::Stopped),
    }
}

fn compare_proc_ids(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y),
        _ => a.cmp(b),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_process_keys() {
        assert_eq!(
            parse_process_key("10000-ABCDEF-tidb").unwrap(),
            ("10000".into(), "ABCDEF".into(), "tidb".into())
        );
        assert_eq!(
            parse_process_key("10001-ABCDEF-my-svc").unwrap().2,
            "my-svc"
        );
        assert!(parse_process_key("10000-ABCDEF").is_err());
        assert!(parse_process_key("10000--tidb").is_err());
        assert!(parse_process_key("garbage").is_err());
    }

    #[tokio::test]
    async fn exhausted_id_retries_are_a_conflict() {
        use std::sync::Arc;
        use std::time::Duration;

        use crate::registry::IdRetry;
        use crate::store::MemoryStore;

        let reg = Registry::new(Arc::new(MemoryStore::new()), "/_pf", Duration::from_secs(1), "")
            .with_id_retry(IdRetry {
                max_attempts: 0,
                ..IdRetry::default()
            });
        reg.bootstrap().await.unwrap();

        let err = reg.generate_proc_id().await.unwrap_err();
        assert_eq!(err.code(), "conflict");
    }

    #[test]
    fn numeric_ordering_of_ids() {
        let mut ids = vec!["10010", "9999", "10002"];
        ids.sort_by(|a, b| compare_proc_ids(a, b));
        assert_eq!(ids, vec!["9999", "10002", "10010"]);
    }
}
