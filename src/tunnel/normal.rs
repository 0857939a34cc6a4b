use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::debug;

use super::crypto::target_matched;
use super::{addr, Dialer, ProxyStream, Reception, TargetAddr, TunnelError};
use crate::access::AccessList;
use crate::stream::IdleTimeoutStream;

/// Same handshake as the crypto tunnel, but in the clear. Useful when
/// the link is already protected (or being debugged).
pub struct NormalDialer {
    upstream: SocketAddr,
    match_gate: bool,
    access_list: Arc<AccessList>,
}

impl NormalDialer {
    pub fn new(upstream: SocketAddr, match_gate: bool, access_list: Arc<AccessList>) -> Self {
        Self {
            upstream,
            match_gate,
            access_list,
        }
    }
}

#[async_trait]
impl Dialer for NormalDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<ProxyStream, TunnelError> {
        if self.match_gate && !target_matched(&self.access_list, target) {
            return Err(TunnelError::NotMatched(target.to_string()));
        }

        let mut stream = TcpStream::connect(self.upstream).await?;
        debug!("plain tunnel to {} for {}", self.upstream, target);
        addr::write_target(&mut stream, target).await?;
        stream.flush().await?;
        Ok(Box::new(stream))
    }
}

/// Clear-text counterpart of the crypto reception.
#[derive(Default)]
pub struct NormalReception;

#[async_trait]
impl Reception for NormalReception {
    async fn recept(
        &self,
        mut stream: IdleTimeoutStream<TcpStream>,
    ) -> Result<(TargetAddr, ProxyStream), TunnelError> {
        let target = addr::read_target(&mut stream).await?;
        Ok((target, Box::new(stream)))
    }
}
