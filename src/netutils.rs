//! Small host-network helpers.

use crate::types::MacAddress;
use std::net::IpAddr;
use tracing::debug;

/// Resolve a neighbor's MAC address from the kernel ARP table
/// (`/proc/net/arp`). Used by the destination-advertisement subprotocol
/// to advertise the attached router's MAC. Returns None off Linux or
/// when the neighbor has no ARP entry yet.
pub fn arp_lookup(ip: &IpAddr, iface: &str) -> Option<MacAddress> {
    let table = std::fs::read_to_string("/proc/net/arp").ok()?;
    let want = ip.to_string();
    for line in table.lines().skip(1) {
        let fields: Vec<&str> = line.split_whitespace().collect();
        // IP address, HW type, Flags, HW address, Mask, Device
        if fields.len() < 6 {
            continue;
        }
        if fields[0] != want {
            continue;
        }
        if !iface.is_empty() && fields[5] != iface {
            continue;
        }
        match fields[3].parse::<MacAddress>() {
            Ok(mac) if mac.bytes.iter().any(|b| *b != 0) => return Some(mac),
            _ => continue,
        }
    }
    debug!("no ARP entry for {} on {:?}", ip, iface);
    None
}

/// Interface name to kernel index, for IPv6 multicast joins and
/// link-local scope ids. Returns None off Linux or for unknown names.
pub fn ifindex(iface: &str) -> Option<u32> {
    if iface.is_empty() {
        return None;
    }
    let path = format!("/sys/class/net/{}/ifindex", iface);
    std::fs::read_to_string(path)
        .ok()?
        .trim()
        .parse()
        .ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_iface_has_no_index() {
        assert_eq!(ifindex("definitely-not-a-device"), None);
        assert_eq!(ifindex(""), None);
    }
}
