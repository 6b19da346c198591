// src/machine/host.rs

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use tracing::{debug, warn};

/// IPv4 addresses of up, non-loopback interfaces, private ranges first.
pub fn intranet_ips() -> Vec<Ipv4Addr> {
    let addrs = match getifaddrs() {
        Ok(addrs) => addrs,
        Err(e) => {
            warn!(error = %e, "listing network interfaces failed");
            return Vec::new();
        }
    };

    let mut ips: Vec<Ipv4Addr> = addrs
        .filter(|ifa| {
            ifa.flags.contains(InterfaceFlags::IFF_UP)
                && !ifa.flags.contains(InterfaceFlags::IFF_LOOPBACK)
        })
        .filter_map(|ifa| {
            let sin = ifa.address?.as_sockaddr_in().copied()?;
            Some(Ipv4Addr::from(sin.ip()))
        })
        .filter(|ip| !ip.is_loopback() && !ip.is_unspecified() && !ip.is_link_local())
        .collect();

    // Stable sort keeps interface order within each group.
    ips.sort_by_key(|ip| !ip.is_private());
    ips.dedup();
    debug!(?ips, "detected local addresses");
    ips
}

/// The address this host advertises when none is configured. Empty when no
/// suitable interface exists.
pub fn detect_host_ip() -> String {
    intranet_ips()
        .first()
        .map(Ipv4Addr::to_string)
        .unwrap_or_default()
}
