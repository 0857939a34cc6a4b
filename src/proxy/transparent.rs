use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use crate::dns::DnsForwarder;
use crate::stream::IdleTimeoutStream;
use crate::tunnel::{ProxyStream, Reception, TargetAddr, TunnelError};

/// Reception for redirected connections: the kernel already rewrote the
/// destination, so the target is the socket's local address, upgraded
/// to a name through the forwarder's reverse cache when the client
/// resolved it through us.
pub struct TransparentReception {
    dns: Arc<DnsForwarder>,
}

impl TransparentReception {
    pub fn new(dns: Arc<DnsForwarder>) -> Self {
        Self { dns }
    }
}

#[async_trait]
impl Reception for TransparentReception {
    async fn recept(
        &self,
        stream: IdleTimeoutStream<TcpStream>,
    ) -> Result<(TargetAddr, ProxyStream), TunnelError> {
        let local = stream.get_ref().local_addr()?;
        let mut target = TargetAddr::from_ip(local.ip(), local.port());
        if let Some(host) = self.dns.get_domain(local.ip()) {
            debug!("reverse cache: {} is {}", local.ip(), host);
            target.fqdn = Some(host);
        }
        Ok((target, Box::new(stream)))
    }
}
