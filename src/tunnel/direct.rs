use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::TcpStream;
use tracing::debug;

use super::crypto::target_matched;
use super::{Dialer, ProxyStream, TargetAddr, TunnelError};
use crate::access::AccessList;

/// Dials the target itself, no tunnel in between.
pub struct DirectDialer {
    match_gate: bool,
    access_list: Arc<AccessList>,
}

impl DirectDialer {
    pub fn new(access_list: Arc<AccessList>) -> Self {
        Self {
            match_gate: false,
            access_list,
        }
    }

    /// Server-side variant: only targets on the access list may be
    /// dialed, so a tunnel peer cannot use us as an open relay.
    pub fn matched_only(access_list: Arc<AccessList>) -> Self {
        Self {
            match_gate: true,
            access_list,
        }
    }
}

#[async_trait]
impl Dialer for DirectDialer {
    async fn dial(&self, target: &TargetAddr) -> Result<ProxyStream, TunnelError> {
        if self.match_gate && !target_matched(&self.access_list, target) {
            return Err(TunnelError::NotMatched(target.to_string()));
        }

        let stream = match target.ip {
            Some(ip) => TcpStream::connect((ip, target.port)).await?,
            None => TcpStream::connect((target.host()?.as_str(), target.port)).await?,
        };
        debug!("direct connection to {}", target);
        Ok(Box::new(stream))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::{AccessList, AccessListConfig};
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn list_with(domains: &[&str]) -> Arc<AccessList> {
        let config = AccessListConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            subnets: Vec::new(),
        };
        Arc::new(AccessList::new(&config).unwrap())
    }

    #[tokio::test]
    async fn dials_by_address() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            stream.write_all(b"ok").await.unwrap();
        });

        let dialer = DirectDialer::new(list_with(&[]));
        let target = TargetAddr::from_ip(listen_addr.ip(), listen_addr.port());
        let mut stream = dialer.dial(&target).await.unwrap();
        let mut buf = [0u8; 2];
        stream.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ok");
    }

    #[tokio::test]
    async fn gate_refuses_unmatched() {
        let dialer = DirectDialer::matched_only(list_with(&["example.com"]));
        let target = TargetAddr::from_domain("other.net", 80);
        assert!(matches!(
            dialer.dial(&target).await,
            Err(TunnelError::NotMatched(_))
        ));
    }
}
