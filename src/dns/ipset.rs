use std::net::Ipv4Addr;

use tracing::debug;

/// Sink for resolved addresses of matched domains.
///
/// The forwarder pushes every matched A record here so the host's
/// routing layer can steer traffic for those addresses. Entries carry
/// the DNS TTL; the implementation decides how to honor it.
pub trait KernelSet: Send + Sync {
    fn install(&self, addr: Ipv4Addr, ttl: u32);
}

/// Records would-be installs in the log and does nothing else. Used
/// when no routing integration is configured, and in tests.
#[derive(Debug, Default)]
pub struct LogOnlySet;

impl KernelSet for LogOnlySet {
    fn install(&self, addr: Ipv4Addr, ttl: u32) {
        debug!("matched address {} (ttl {}s), no kernel set configured", addr, ttl);
    }
}
