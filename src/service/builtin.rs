// src/service/builtin.rs

//! TiDB, PD and TiKV.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use super::flags::{ipv4_of, port_of, scan};
use super::{ServiceDefaults, ServiceDescriptor};
use crate::types::Endpoint;

/// The services every minion knows about without extra registration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuiltinService {
    TiDB,
    Pd,
    TiKv,
}

/// How an endpoint follows a flag value.
#[derive(Debug, Clone, Copy)]
enum Source {
    /// The whole value is the port, e.g. `-P 4000`.
    Port,
    /// `host:port`; only the port is taken.
    AddrPort,
    /// `host:port`; the host is taken too when it is a literal IPv4.
    AdvertiseAddr,
}

/// A flag the binary accepts, with the value it assumes when absent.
struct Flag {
    name: &'static str,
    default: &'static str,
}

struct Binding {
    endpoint: &'static str,
    flag: &'static str,
    source: Source,
}

const fn flag(name: &'static str, default: &'static str) -> Flag {
    Flag { name, default }
}

const fn bind(endpoint: &'static str, flag: &'static str, source: Source) -> Binding {
    Binding {
        endpoint,
        flag,
        source,
    }
}

const TIDB_FLAGS: &[Flag] = &[
    flag("store", "goleveldb"),
    flag("path", "/tmp/tidb"),
    flag("L", "debug"),
    flag("P", "4000"),
    flag("status", "10080"),
    flag("lease", "1"),
];

const TIDB_BINDINGS: &[Binding] = &[
    bind("TIDB_ADDR", "P", Source::Port),
    bind("TIDB_STATUS_ADDR", "status", Source::Port),
];

const PD_FLAGS: &[Flag] = &[
    flag("addr", "127.0.0.1:1234"),
    flag("advertise-addr", ""),
    flag("etcd", "127.0.0.1:2379"),
    flag("root", "/pd"),
    flag("lease", "3"),
    flag("L", "debug"),
    flag("pprof", ":6060"),
    flag("cluster-id", "0"),
    flag("max-peer-count", "3"),
];

const PD_BINDINGS: &[Binding] = &[
    bind("PD_ADDR", "addr", Source::AddrPort),
    bind("PD_ADVERTISE_ADDR", "advertise-addr", Source::AdvertiseAddr),
    bind("PD_PPROF_ADDR", "pprof", Source::AddrPort),
];

const TIKV_FLAGS: &[Flag] = &[
    flag("addr", "127.0.0.1:5551"),
    flag("advertise-addr", "127.0.0.1:5551"),
    flag("L", "debug"),
    flag("store", "data"),
    flag("S", "raftkv"),
    flag("cluster-id", "1"),
    flag("etcd", "127.0.0.1:2379"),
];

const TIKV_BINDINGS: &[Binding] = &[
    bind("TIKV_ADDR", "addr", Source::AddrPort),
    bind("TIKV_ADVERTISE_ADDR", "advertise-addr", Source::AdvertiseAddr),
];

fn strings(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

impl BuiltinService {
    pub const ALL: [BuiltinService; 3] = [BuiltinService::TiDB, BuiltinService::Pd, BuiltinService::TiKv];

    fn flags(self) -> &'static [Flag] {
        match self {
            BuiltinService::TiDB => TIDB_FLAGS,
            BuiltinService::Pd => PD_FLAGS,
            BuiltinService::TiKv => TIKV_FLAGS,
        }
    }

    fn flag_default(self, name: &str) -> &'static str {
        self.flags()
            .iter()
            .find(|f| f.name == name)
            .map(|f| f.default)
            .unwrap_or("")
    }

    fn bindings(self) -> &'static [Binding] {
        match self {
            BuiltinService::TiDB => TIDB_BINDINGS,
            BuiltinService::Pd => PD_BINDINGS,
            BuiltinService::TiKv => TIKV_BINDINGS,
        }
    }

    fn default_endpoints(self) -> BTreeMap<String, Endpoint> {
        let list: &[(&str, &str, &str)] = match self {
            BuiltinService::TiDB => &[
                ("TIDB_ADDR", "mysql", "4000"),
                ("TIDB_STATUS_ADDR", "http", "10080"),
            ],
            BuiltinService::Pd => &[
                ("PD_ADDR", "", "1234"),
                ("PD_ADVERTISE_ADDR", "", "1234"),
                ("PD_PPROF_ADDR", "", "6060"),
            ],
            BuiltinService::TiKv => &[
                ("TIKV_ADDR", "", "5551"),
                ("TIKV_ADVERTISE_ADDR", "", "5551"),
            ],
        };
        list.iter()
            .map(|(name, proto, port)| (name.to_string(), Endpoint::new(proto, "", port)))
            .collect()
    }
}

impl ServiceDescriptor for BuiltinService {
    fn name(&self) -> &str {
        match self {
            BuiltinService::TiDB => "TiDB",
            BuiltinService::Pd => "PD",
            BuiltinService::TiKv => "TiKV",
        }
    }

    fn version(&self) -> &str {
        "1.0.0"
    }

    fn defaults(&self) -> ServiceDefaults {
        let (command, args) = match self {
            BuiltinService::TiDB => (
                "bin/tidb-server",
                strings(&[
                    "-L", "info", "--store", "tikv", "--path", "$ETCD_ADDR/pd?cluster=1", "-P",
                    "4000", "--lease", "1",
                ]),
            ),
            BuiltinService::Pd => (
                "bin/pd-server",
                strings(&[
                    "--addr", "0.0.0.0:1234", "--advertise-addr", "$HOST_IP:1234", "--etcd",
                    "$ETCD_ADDR", "--pprof", ":6060", "-L", "debug", "--cluster-id", "1",
                    "--max-peer-count", "3",
                ]),
            ),
            BuiltinService::TiKv => (
                "bin/tikv-server",
                strings(&[
                    "-S", "raftkv", "--addr", "0.0.0.0:5551", "--advertise-addr",
                    "$HOST_IP:5551", "--etcd", "$ETCD_ADDR", "--store", "data", "--cluster-id",
                    "1",
                ]),
            ),
        };
        ServiceDefaults {
            executor: Vec::new(),
            command: command.to_string(),
            args,
            environment: HashMap::new(),
            endpoints: self.default_endpoints(),
        }
    }

    fn endpoints_from_args(&self, args: &[String]) -> BTreeMap<String, Endpoint> {
        let mut endpoints = self.default_endpoints();
        let known: Vec<&str> = self.flags().iter().map(|f| f.name).collect();
        let parsed = match scan(&known, args) {
            Ok(parsed) => parsed,
            Err(e) => {
                debug!(svc = self.name(), error = %e, "unparseable arguments; using default endpoints");
                return endpoints;
            }
        };
        for binding in self.bindings() {
            let Some(ep) = endpoints.get_mut(binding.endpoint) else {
                continue;
            };
            let value = match parsed.get(binding.flag) {
                Some(value) => value.as_str(),
                None => self.flag_default(binding.flag),
            };
            match binding.source {
                Source::Port => {
                    if let Ok(port) = value.parse::<u16>() {
                        ep.port = port.to_string();
                    }
                }
                Source::AddrPort => {
                    if let Some(port) = port_of(value) {
                        ep.port = port;
                    }
                }
                Source::AdvertiseAddr => {
                    if let Some(ip) = ipv4_of(value) {
                        ep.ip_addr = ip;
                    }
                    if let Some(port) = port_of(value) {
                        ep.port = port;
                    }
                }
            }
        }
        endpoints
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn templated_advertise_host_is_not_taken_as_ip() {
        let pd = BuiltinService::Pd;
        let eps = pd.endpoints_from_args(&pd.defaults().args);
        assert_eq!(eps["PD_ADVERTISE_ADDR"], Endpoint::new("", "", "1234"));
        assert_eq!(eps["PD_ADDR"].port, "1234");
    }

    #[test]
    fn literal_advertise_ip_is_kept() {
        let tikv = BuiltinService::TiKv;
        let eps = tikv.endpoints_from_args(&strings(&["--advertise-addr", "10.0.0.7:20160"]));
        assert_eq!(eps["TIKV_ADVERTISE_ADDR"], Endpoint::new("", "10.0.0.7", "20160"));
        // --addr not given: the binary's own default applies.
        assert_eq!(eps["TIKV_ADDR"].port, "5551");
    }

    #[test]
    fn absent_tikv_advertise_flag_falls_back_to_loopback_default() {
        let tikv = BuiltinService::TiKv;
        let eps = tikv.endpoints_from_args(&strings(&["--addr", "0.0.0.0:6000"]));
        assert_eq!(eps["TIKV_ADDR"].port, "6000");
        assert_eq!(eps["TIKV_ADVERTISE_ADDR"].ip_addr, "127.0.0.1");
    }

    #[test]
    fn unknown_flag_yields_default_endpoints() {
        let tidb = BuiltinService::TiDB;
        let eps = tidb.endpoints_from_args(&strings(&["-P", "5000", "--socket", "/tmp/s"]));
        assert_eq!(eps, tidb.defaults().endpoints);
    }

    #[test]
    fn tidb_port_override() {
        let tidb = BuiltinService::TiDB;
        let eps = tidb.endpoints_from_args(&strings(&["-P", "5000", "--status=11080"]));
        assert_eq!(eps["TIDB_ADDR"].to_string(), "mysql://0.0.0.0:5000");
        assert_eq!(eps["TIDB_STATUS_ADDR"].port, "11080");
    }
}
