//! TCP proxy pipeline: accept, recover the target, sniff, classify,
//! dial, then shuffle bytes until both directions finish.

pub mod socks5;
pub mod transparent;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, error, info, warn};

use crate::access::AccessList;
use crate::config::{Config, Mode};
use crate::dns::DnsForwarder;
use crate::sniff::{Filters, PeekReader, SniffError};
use crate::stream::IdleTimeoutStream;
use crate::tunnel::{
    CryptoDialer, CryptoReception, Dialer, DirectDialer, PacDialer, Reception, TunnelError,
};

pub use socks5::Socks5Reception;
pub use transparent::TransparentReception;

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("proxy i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Tunnel(#[from] TunnelError),
    #[error("sniff failed: {0}")]
    Sniff(#[from] SniffError),
    #[error("mode requires {0}")]
    IncompleteMode(&'static str),
}

pub struct Proxy {
    listener: TcpListener,
    reception: Arc<dyn Reception>,
    /// Dialer for targets on the access list.
    matched_dialer: Arc<dyn Dialer>,
    /// Dialer for everything else.
    unmatched_dialer: Arc<dyn Dialer>,
    filters: Arc<Filters>,
    access_list: Arc<AccessList>,
    timeout: Duration,
}

impl Proxy {
    /// Binds the listener and wires reception and dialers for the
    /// configured mode. Transparent mode needs the DNS forwarder for
    /// its reverse cache.
    pub async fn bind(
        config: &Config,
        access_list: Arc<AccessList>,
        dns: Option<Arc<DnsForwarder>>,
    ) -> Result<Self, ProxyError> {
        let filters = Arc::new(
            config
                .build_filters()
                .map_err(|_| ProxyError::IncompleteMode("distinct filter ports"))?,
        );
        let key = config.key.as_deref().unwrap_or("");

        let (reception, matched_dialer, unmatched_dialer): (
            Arc<dyn Reception>,
            Arc<dyn Dialer>,
            Arc<dyn Dialer>,
        ) = match config.mode {
            Mode::Transparent => {
                let dns = dns.ok_or(ProxyError::IncompleteMode("the DNS forwarder"))?;
                let upstream = config
                    .upstream
                    .ok_or(ProxyError::IncompleteMode("an upstream address"))?;
                let tunnel: Arc<dyn Dialer> = Arc::new(CryptoDialer::new(
                    upstream,
                    key,
                    true,
                    access_list.clone(),
                )?);
                let direct: Arc<dyn Dialer> = Arc::new(DirectDialer::new(access_list.clone()));
                let reception: Arc<dyn Reception> = Arc::new(TransparentReception::new(dns));
                (reception, tunnel, direct)
            }
            Mode::SocksLocal => {
                let upstream = config
                    .upstream
                    .ok_or(ProxyError::IncompleteMode("an upstream address"))?;
                let tunnel: Arc<dyn Dialer> = Arc::new(CryptoDialer::new(
                    upstream,
                    key,
                    false,
                    access_list.clone(),
                )?);
                let direct: Arc<dyn Dialer> = Arc::new(DirectDialer::new(access_list.clone()));
                let pac: Arc<dyn Dialer> =
                    Arc::new(PacDialer::new(tunnel, direct, access_list.clone()));
                let reception: Arc<dyn Reception> = Arc::new(Socks5Reception);
                (reception, pac.clone(), pac)
            }
            Mode::SocksServer => {
                let direct: Arc<dyn Dialer> =
                    Arc::new(DirectDialer::matched_only(access_list.clone()));
                let reception: Arc<dyn Reception> = Arc::new(CryptoReception::new(key)?);
                (reception, direct.clone(), direct)
            }
        };

        let listener = TcpListener::bind(config.listen).await?;
        info!("proxy listening on {}", listener.local_addr()?);

        Ok(Self {
            listener,
            reception,
            matched_dialer,
            unmatched_dialer,
            filters,
            access_list,
            timeout: Duration::from_millis(config.timeout_ms),
        })
    }

    pub fn local_addr(&self) -> Result<std::net::SocketAddr, std::io::Error> {
        self.listener.local_addr()
    }

    /// Accept loop. One task per connection; accept errors are logged
    /// and the loop keeps going.
    pub async fn run(self: Arc<Self>) -> Result<(), std::io::Error> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("accept failed: {}", e);
                    continue;
                }
            };
            let proxy = self.clone();
            tokio::spawn(async move {
                if let Err(e) = proxy.serve(stream).await {
                    warn!("connection from {} failed: {}", peer, e);
                }
            });
        }
    }

    async fn serve(&self, stream: TcpStream) -> Result<(), ProxyError> {
        // The idle deadline covers the whole client leg, reception
        // handshake included, so a peer that connects and goes silent
        // cannot pin a task forever.
        let stream = IdleTimeoutStream::new(stream, self.timeout);
        let (mut target, stream) = self.reception.recept(stream).await?;
        let (read_half, mut write_half) = tokio::io::split(stream);
        let mut reader = PeekReader::new(read_half);

        // A sniffed name beats whatever the reception recovered; a
        // sniff failure is not fatal, the connection still relays on
        // the address we already have.
        let mut replay = Vec::new();
        match self.filters.exec(&mut reader, target.port).await {
            Ok(sniffed) => {
                if let Some(host) = sniffed.host {
                    target.fqdn = Some(host);
                }
                replay = sniffed.replay;
            }
            Err(e) => {
                warn!("sniff on port {} failed: {}", target.port, e);
            }
        }

        let matched = match &target.fqdn {
            Some(fqdn) => self.access_list.match_domain(fqdn),
            None => target.ip.is_some_and(|ip| self.access_list.match_ip(ip)),
        };
        debug!(
            "{} {}",
            target,
            if matched { "matched" } else { "not matched" }
        );

        let dialer = if matched {
            &self.matched_dialer
        } else {
            &self.unmatched_dialer
        };
        let upstream = dialer.dial(&target).await?;
        let upstream = IdleTimeoutStream::new(upstream, self.timeout);
        let (mut up_read, mut up_write) = tokio::io::split(upstream);

        if !replay.is_empty() {
            up_write.write_all(&replay).await?;
        }

        let client_to_upstream = tokio::spawn(async move {
            let result = tokio::io::copy(&mut reader, &mut up_write).await;
            let _ = up_write.shutdown().await;
            result
        });
        let upstream_to_client = tokio::spawn(async move {
            let result = tokio::io::copy(&mut up_read, &mut write_half).await;
            let _ = write_half.shutdown().await;
            result
        });

        let (sent, received) = tokio::join!(client_to_upstream, upstream_to_client);
        match (sent, received) {
            (Ok(Ok(sent)), Ok(Ok(received))) => {
                debug!("{}: {} bytes out, {} bytes in", target, sent, received);
            }
            (sent, received) => {
                for result in [sent, received] {
                    if let Ok(Err(e)) = result {
                        warn!("{}: relay ended with error: {}", target, e);
                    }
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::access::AccessListConfig;
    use crate::sniff::FilterKind;
    use crate::tunnel::{NormalReception, ProxyStream, TargetAddr};
    use async_trait::async_trait;
    use std::net::IpAddr;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    /// Dialer that hands back one end of an echo pipe and counts uses.
    struct EchoDialer {
        dials: AtomicUsize,
    }

    impl EchoDialer {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                dials: AtomicUsize::new(0),
            })
        }

        fn count(&self) -> usize {
            self.dials.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl Dialer for EchoDialer {
        async fn dial(&self, _target: &TargetAddr) -> Result<ProxyStream, TunnelError> {
            self.dials.fetch_add(1, Ordering::SeqCst);
            let (near, far) = tokio::io::duplex(4096);
            tokio::spawn(async move {
                let (mut read, mut write) = tokio::io::split(far);
                if tokio::io::copy(&mut read, &mut write).await.is_ok() {
                    let _ = write.shutdown().await;
                }
            });
            Ok(Box::new(near))
        }
    }

    /// Reception returning a fixed target, like the transparent one
    /// does for a redirected connection.
    struct FixedReception(TargetAddr);

    #[async_trait]
    impl Reception for FixedReception {
        async fn recept(
            &self,
            stream: IdleTimeoutStream<TcpStream>,
        ) -> Result<(TargetAddr, ProxyStream), TunnelError> {
            Ok((self.0.clone(), Box::new(stream)))
        }
    }

    fn access_list(domains: &[&str]) -> Arc<AccessList> {
        let config = AccessListConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            subnets: Vec::new(),
        };
        Arc::new(AccessList::new(&config).unwrap())
    }

    async fn test_proxy(
        reception: Arc<dyn Reception>,
        domains: &[&str],
    ) -> (
        Arc<EchoDialer>,
        Arc<EchoDialer>,
        std::net::SocketAddr,
    ) {
        let mut filters = Filters::new();
        filters.add(FilterKind::Http, 80).unwrap();
        filters.add(FilterKind::Tls, 443).unwrap();

        let matched = EchoDialer::new();
        let unmatched = EchoDialer::new();
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let listen_addr = listener.local_addr().unwrap();
        let proxy = Arc::new(Proxy {
            listener,
            reception,
            matched_dialer: matched.clone(),
            unmatched_dialer: unmatched.clone(),
            filters: Arc::new(filters),
            access_list: access_list(domains),
            timeout: Duration::from_secs(5),
        });
        tokio::spawn(proxy.run());
        (matched, unmatched, listen_addr)
    }

    async fn exchange(stream: &mut TcpStream, payload: &[u8]) -> Vec<u8> {
        stream.write_all(payload).await.unwrap();
        let _ = AsyncWriteExt::shutdown(stream).await;
        let mut echoed = Vec::new();
        stream.read_to_end(&mut echoed).await.unwrap();
        echoed
    }

    /// Matched targets go through the matched dialer, others through
    /// the fallback, and payloads survive the relay byte for byte.
    #[tokio::test]
    async fn classification_picks_dialer() {
        let reception = Arc::new(NormalReception);
        let (matched, unmatched, listen_addr) = test_proxy(reception, &["example.com"]).await;

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        let target = TargetAddr::from_domain("www.example.com", 9999);
        crate::tunnel::addr::write_target(&mut client, &target)
            .await
            .unwrap();
        let echoed = exchange(&mut client, b"matched payload").await;
        assert_eq!(echoed, b"matched payload");
        assert_eq!(matched.count(), 1);
        assert_eq!(unmatched.count(), 0);

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        let target = TargetAddr::from_domain("other.net", 9999);
        crate::tunnel::addr::write_target(&mut client, &target)
            .await
            .unwrap();
        let echoed = exchange(&mut client, b"direct payload").await;
        assert_eq!(echoed, b"direct payload");
        assert_eq!(matched.count(), 1);
        assert_eq!(unmatched.count(), 1);
    }

    /// An HTTP request on a filtered port upgrades an address-only
    /// target to its Host name, flipping the classification, and the
    /// upstream still sees the entire request.
    #[tokio::test]
    async fn sniffed_host_reclassifies() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let reception = Arc::new(FixedReception(TargetAddr::from_ip(ip, 80)));
        let (matched, unmatched, listen_addr) = test_proxy(reception, &["example.com"]).await;

        let request = b"GET / HTTP/1.1\r\nHost: www.example.com\r\n\r\n";
        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        let echoed = exchange(&mut client, request).await;
        assert_eq!(echoed, request);
        assert_eq!(matched.count(), 1);
        assert_eq!(unmatched.count(), 0);
    }

    /// Unfiltered payload on a filtered port still relays; it just
    /// stays classified by address.
    #[tokio::test]
    async fn unrecognized_payload_relays() {
        let ip: IpAddr = "192.0.2.10".parse().unwrap();
        let reception = Arc::new(FixedReception(TargetAddr::from_ip(ip, 80)));
        let (matched, unmatched, listen_addr) = test_proxy(reception, &[]).await;

        let mut client = TcpStream::connect(listen_addr).await.unwrap();
        let echoed = exchange(&mut client, b"\x00binary junk").await;
        assert_eq!(echoed, b"\x00binary junk");
        assert_eq!(matched.count(), 0);
        assert_eq!(unmatched.count(), 1);
    }
}
