// src/registry/machine.rs

use std::time::Duration;

use tracing::{debug, info};

use super::{ALIVE, MACHINE_DIR, OBJECT, Registry, STATISTIC};
use crate::errors::{Error, Result};
use crate::model::{MachineInfo, MachineStat, MachineStatus};
use crate::store::{GetOptions, Node, SetOptions, StoreError};

impl Registry {
    /// Create or update a machine entry and mark it alive.
    ///
    /// A new machine gets its `object`, a zeroed `statistic`, and an `alive`
    /// key. A known machine only has its `object` rewritten and `alive`
    /// refreshed.
    pub async fn register_machine(
        &self,
        mach_id: &str,
        info: &MachineInfo,
        ttl: Duration,
    ) -> Result<()> {
        let dir = self.key(&[MACHINE_DIR, mach_id]);
        let object_key = self.key(&[MACHINE_DIR, mach_id, OBJECT]);
        let object = serde_json::to_string(info)?;

        match self
            .call("read machine", self.store.get(&dir, GetOptions::quorum()))
            .await
        {
            Ok(node) if node.dir => {
                self.call(
                    "update machine object",
                    self.store.set(&object_key, &object, SetOptions::default()),
                )
                .await?;
                debug!(mach_id, "updated machine object");
            }
            Ok(node) => {
                return Err(Error::Corrupt(format!("{} is not a directory", node.key)));
            }
            Err(StoreError::KeyNotFound(_)) => {
                let stat = serde_json::to_string(&MachineStat::default())?;
                let stat_key = self.key(&[MACHINE_DIR, mach_id, STATISTIC]);
                self.call("create machine dir", self.store.set(&dir, "", SetOptions::create().dir()))
                    .await?;
                self.call(
                    "create machine object",
                    self.store.set(&object_key, &object, SetOptions::create()),
                )
                .await?;
                self.call(
                    "create machine statistic",
                    self.store.set(&stat_key, &stat, SetOptions::create()),
                )
                .await?;
                info!(mach_id, host = %info.host_name, ip = %info.public_ip, "registered new machine");
            }
            Err(e) => return Err(e.into()),
        }

        self.refresh_or_create_alive(&self.key(&[MACHINE_DIR, mach_id, ALIVE]), ttl)
            .await
    }

    /// Store a fresh statistics snapshot and refresh liveness. The machine
    /// must already be registered.
    pub async fn refresh_machine(
        &self,
        mach_id: &str,
        stat: &MachineStat,
        ttl: Duration,
    ) -> Result<()> {
        let stat_key = self.key(&[MACHINE_DIR, mach_id, STATISTIC]);
        let value = serde_json::to_string(stat)?;
        self.call(
            "write machine statistic",
            self.store.set(&stat_key, &value, SetOptions::update()),
        )
        .await
        .map_err(|e| match e {
            StoreError::KeyNotFound(_) => Error::NotFound(format!("machine {mach_id}")),
            other => other.into(),
        })?;

        self.refresh_or_create_alive(&self.key(&[MACHINE_DIR, mach_id, ALIVE]), ttl)
            .await
    }

    /// Every registered machine, ordered by ID. All-or-nothing.
    pub async fn machines(&self) -> Result<Vec<MachineStatus>> {
        let dir = self.key(&[MACHINE_DIR]);
        let root = match self
            .call("read machines", self.store.get(&dir, GetOptions::recursive()))
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
            .map(machine_status_from_node)
            .collect::<Result<Vec<_>>>()?;
        out.sort_by(|a, b| a.mach_id.cmp(&b.mach_id));
        Ok(out)
    }

    pub async fn machine(&self, mach_id: &str) -> Result<MachineStatus> {
        let dir = self.key(&[MACHINE_DIR, mach_id]);
        let node = self
            .call("read machine", self.store.get(&dir, GetOptions::recursive()))
            .await
            .map_err(|e| match e {
                StoreError::KeyNotFound(_) => Error::NotFound(format!("machine {mach_id}")),
                other => other.into(),
            })?;
        machine_status_from_node(&node)
    }
}

fn machine_status_from_node(node: &Node) -> Result<MachineStatus> {
    if !node.dir {
        return Err(Error::Corrupt(format!("{} is not a machine directory", node.key)));
    }

    let mach_info = match node.child(OBJECT) {
        Some(obj) => serde_json::from_str(&obj.value)
            .map_err(|e| Error::Corrupt(format!("{}: invalid machine info: {e}", obj.key)))?,
        None => MachineInfo::default(),
    };
    let mach_stat = match node.child(STATISTIC) {
        Some(stat) => serde_json::from_str(&stat.value)
            .map_err(|e| Error::Corrupt(format!("{}: invalid machine stat: {e}", stat.key)))?,
        None => MachineStat::default(),
    };

    Ok(MachineStatus {
        mach_id: node.base_name().to_string(),
        is_alive: node.child(ALIVE).is_some(),
        mach_info,
        mach_stat,
    })
}
