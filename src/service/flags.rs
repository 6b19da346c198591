// src/service/flags.rs

//! Minimal command-line flag scanner for the built-in service binaries.
//!
//! Accepts `-name value`, `--name value`, `-name=value` and `--name=value`.
//! Scanning stops at the first positional argument or at `--`. An unknown
//! flag or a flag without a value fails the whole scan.

use std::collections::HashMap;
use std::net::Ipv4Addr;

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum FlagError {
    Unknown(String),
    MissingValue(String),
}

impl std::fmt::Display for FlagError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlagError::Unknown(name) => write!(f, "flag provided but not defined: -{name}"),
            FlagError::MissingValue(name) => write!(f, "flag needs an argument: -{name}"),
        }
    }
}

/// Scan `args` for the flags in `known`. Later occurrences win.
pub(crate) fn scan(known: &[&str], args: &[String]) -> Result<HashMap<String, String>, FlagError> {
    let mut out = HashMap::new();
    let mut iter = args.iter();

    while let Some(arg) = iter.next() {
        if arg == "--" {
            break;
        }
        let Some(body) = arg.strip_prefix('-') else {
            break;
        };
        let body = body.strip_prefix('-').unwrap_or(body);
        if body.is_empty() {
            break;
        }

        let (name, inline) = match body.split_once('=') {
            Some((name, value)) => (name, Some(value.to_string())),
            None => (body, None),
        };
        if !known.contains(&name) {
            return Err(FlagError::Unknown(name.to_string()));
        }
        let value = match inline {
            Some(value) => value,
            None => iter
                .next()
                .cloned()
                .ok_or_else(|| FlagError::MissingValue(name.to_string()))?,
        };
        out.insert(name.to_string(), value);
    }

    Ok(out)
}

/// Port part of `host:port`, if it is numeric.
pub(crate) fn port_of(addr: &str) -> Option<String> {
    let port = addr.split(':').nth(1)?;
    port.parse::<u16>().ok().map(|p| p.to_string())
}

/// Host part of `host:port`, only when it is a literal IPv4 address.
pub(crate) fn ipv4_of(addr: &str) -> Option<String> {
    let (host, _) = addr.split_once(':')?;
    host.parse::<Ipv4Addr>().ok().map(|ip| ip.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn all_flag_spellings_are_accepted() {
        let got = scan(
            &["addr", "L", "pprof"],
            &args(&["--addr", "0.0.0.0:1", "-L=info", "-pprof", ":6060"]),
        )
        .unwrap();
        assert_eq!(got["addr"], "0.0.0.0:1");
        assert_eq!(got["L"], "info");
        assert_eq!(got["pprof"], ":6060");
    }

    #[test]
    fn unknown_flag_fails_the_scan() {
        let err = scan(&["addr"], &args(&["--addr", "x:1", "--bogus", "1"])).unwrap_err();
        assert_eq!(err, FlagError::Unknown("bogus".into()));
    }

    #[test]
    fn trailing_flag_without_value_fails() {
        let err = scan(&["addr"], &args(&["--addr"])).unwrap_err();
        assert_eq!(err, FlagError::MissingValue("addr".into()));
    }

    #[test]
    fn scanning_stops_at_positionals() {
        let got = scan(&["P"], &args(&["-P", "4001", "extra", "--unknown"])).unwrap();
        assert_eq!(got["P"], "4001");
    }

    #[test]
    fn address_helpers() {
        assert_eq!(port_of(":6060").as_deref(), Some("6060"));
        assert_eq!(port_of("0.0.0.0:x"), None);
        assert_eq!(ipv4_of("10.1.2.3:5551").as_deref(), Some("10.1.2.3"));
        assert_eq!(ipv4_of("$HOST_IP:5551"), None);
        assert_eq!(ipv4_of("localhost:5551"), None);
        assert_eq!(ipv4_of("999.1.1.1:5551"), None);
        assert_eq!(ipv4_of("10.1.2:5551"), None);
    }
}
