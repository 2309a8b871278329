//! Host identity helpers
//!
//! Signals used to derive the per-deployment shard pair of the id generator.

use if_addrs::IfAddr;

/// Get the first non-loopback IPv4 address of this host
///
/// Returns `None` when no such interface exists or enumeration fails.
pub fn local_ip() -> Option<String> {
    if_addrs::get_if_addrs().ok().and_then(|addrs| {
        addrs
            .into_iter()
            .find(|iface| !iface.is_loopback() && matches!(iface.addr, IfAddr::V4(_)))
            .and_then(|iface| match iface.addr {
                IfAddr::V4(addr) => Some(addr.ip.to_string()),
                _ => None,
            })
    })
}

/// Get the hostname of this machine, if it is valid UTF-8 and not blank
pub fn host_name() -> Option<String> {
    hostname::get()
        .ok()
        .and_then(|name| name.into_string().ok())
        .filter(|name| !name.trim().is_empty())
}

/// Fold a string into a shard number in `[0, 31]` by summing its bytes
pub fn shard_of(signal: &str) -> u64 {
    signal.bytes().map(u64::from).sum::<u64>() % 32
}
