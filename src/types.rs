// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Run state of a logical process, both as desired by the control plane and
/// as last published by the owning minion.
///
/// The wire form is the plain string stored in the `desired-state` /
/// `current-state` leaves: `"StateStarted"` or `"StateStopped"`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcessState {
    #[serde(rename = "StateStarted")]
    Started,
    #[serde(rename = "StateStopped")]
    Stopped,
}

impl ProcessState {
    pub fn as_str(self) -> &'static str {
        match self {
            ProcessState::Started => "StateStarted",
            ProcessState::Stopped => "StateStopped",
        }
    }

    /// The value a `current-state` CAS write must find before it may store
    /// `self`.
    pub fn opposite(self) -> Self {
        match self {
            ProcessState::Started => ProcessState::Stopped,
            ProcessState::Stopped => ProcessState::Started,
        }
    }
}

impl Default for ProcessState {
    fn default() -> Self {
        ProcessState::Stopped
    }
}

impl fmt::Display for ProcessState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProcessState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "StateStarted" => Ok(ProcessState::Started),
            "StateStopped" => Ok(ProcessState::Stopped),
            other => Err(format!(
                "invalid process state: {other:?} (expected \"StateStarted\" or \"StateStopped\")"
            )),
        }
    }
}

/// One network-reachable interface a process exposes.
///
/// Rendered as `protocol://ip:port`, or `ip:port` when no protocol is set.
/// An unset IP renders as `0.0.0.0`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    #[serde(rename = "Protocol", default)]
    pub protocol: String,
    #[serde(rename = "IPAddr", default)]
    pub ip_addr: String,
    #[serde(rename = "Port", default)]
    pub port: String,
}

impl Endpoint {
    pub fn new(protocol: &str, ip_addr: &str, port: &str) -> Self {
        Self {
            protocol: protocol.to_string(),
            ip_addr: ip_addr.to_string(),
            port: port.to_string(),
        }
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let ip = if self.ip_addr.is_empty() {
            "0.0.0.0"
        } else {
            self.ip_addr.as_str()
        };
        if self.protocol.is_empty() {
            write!(f, "{ip}:{}", self.port)
        } else {
            write!(f, "{}://{ip}:{}", self.protocol, self.port)
        }
    }
}

impl FromStr for Endpoint {
    type Err = String;

    /// Accepts `proto://ip:port`, `ip:port` and `:port`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let (protocol, rest) = match s.split_once("://") {
            Some((proto, rest)) => (proto, rest),
            None => ("", s),
        };
        let (ip, port) = rest
            .rsplit_once(':')
            .ok_or_else(|| format!("endpoint {s:?} has no port"))?;
        if port.is_empty() || !port.chars().all(|c| c.is_ascii_digit()) {
            return Err(format!("endpoint {s:?} has an invalid port"));
        }
        Ok(Endpoint::new(protocol, ip, port))
    }
}
