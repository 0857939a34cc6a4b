//! Split-horizon UDP DNS forwarder.
//!
//! Queries for names on the access list go to the specified upstream,
//! everything else to the default upstream. Matched answers are cached
//! forward (name to address) and reverse (address to name), pushed into
//! the kernel set for routing, and short queries are answered straight
//! from the cache. Outgoing transaction IDs are rewritten to internally
//! allocated ones so concurrent clients reusing an ID cannot collide,
//! and restored before the reply is relayed back.

pub mod cache;
pub mod ipset;
pub mod wire;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tracing::{debug, error, info, warn};

use crate::access::AccessList;
use cache::TtlCache;
use ipset::KernelSet;
use wire::{parse_answers, parse_question, Question, Record};

/// Buffer size for DNS packets (EDNS0 supports up to 4096).
const DNS_BUF_SIZE: usize = 4096;

/// Maximum time a forwarded query may wait for its upstream reply.
const INFLIGHT_TTL: Duration = Duration::from_secs(10);

/// TTL stamped on replies synthesized from the forward cache.
const CACHED_REPLY_TTL: u32 = 60;

/// TTL stamped on sentinel replies for public-service queries.
const SENTINEL_TTL: u32 = 3600;

/// Alias chains longer than this are treated as broken.
const MAX_ALIAS_HOPS: usize = 8;

/// Forwarder addressing and policy.
#[derive(Debug, Clone)]
pub struct DnsSettings {
    pub listen: SocketAddr,
    /// Upstream for names not on the access list.
    pub default_upstream: SocketAddr,
    /// Upstream for names on the access list.
    pub specified_upstream: SocketAddr,
    /// When true, matched A queries from non-loopback clients are
    /// answered with the sentinel address instead of being forwarded.
    pub public_service: bool,
    pub sentinel: Option<Ipv4Addr>,
}

struct InflightQuery {
    client: SocketAddr,
    original_txid: u16,
    name: String,
    matched: bool,
    inserted_at: Instant,
}

pub struct DnsForwarder {
    listen_socket: Arc<UdpSocket>,
    upstream_socket: Arc<UdpSocket>,
    settings: DnsSettings,
    access_list: Arc<AccessList>,
    kernel_set: Arc<dyn KernelSet>,
    inflight: Mutex<HashMap<u16, InflightQuery>>,
    next_txid: AtomicUsize,
    /// Matched name to resolved address.
    forward: TtlCache<String, Ipv4Addr>,
    /// Resolved address back to the queried name.
    reverse: TtlCache<IpAddr, String>,
    /// Collapsed CNAME links, each pointing at its chain's final name.
    aliases: TtlCache<String, String>,
}

impl DnsForwarder {
    /// Binds the listen socket plus an ephemeral upstream socket.
    pub async fn bind(
        settings: DnsSettings,
        access_list: Arc<AccessList>,
        kernel_set: Arc<dyn KernelSet>,
    ) -> Result<Self, std::io::Error> {
        let listen_socket = UdpSocket::bind(settings.listen).await?;
        let upstream_bind = if settings.listen.is_ipv6() {
            SocketAddr::new(std::net::Ipv6Addr::UNSPECIFIED.into(), 0)
        } else {
            SocketAddr::new(Ipv4Addr::UNSPECIFIED.into(), 0)
        };
        let upstream_socket = UdpSocket::bind(upstream_bind).await?;
        info!(
            "DNS forwarder on {} (default {}, specified {})",
            listen_socket.local_addr()?,
            settings.default_upstream,
            settings.specified_upstream
        );
        Ok(Self {
            listen_socket: Arc::new(listen_socket),
            upstream_socket: Arc::new(upstream_socket),
            settings,
            access_list,
            kernel_set,
            inflight: Mutex::new(HashMap::new()),
            next_txid: AtomicUsize::new(0),
            forward: TtlCache::new(),
            reverse: TtlCache::new(),
            aliases: TtlCache::new(),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, std::io::Error> {
        self.listen_socket.local_addr()
    }

    /// Reverse-cache lookup used by the transparent pipeline to recover
    /// the name a client resolved before connecting.
    pub fn get_domain(&self, addr: IpAddr) -> Option<String> {
        self.reverse.get(&addr)
    }

    /// Runs the client-facing and upstream-facing loops until either
    /// socket fails.
    pub async fn run(&self) -> Result<(), std::io::Error> {
        tokio::try_join!(self.run_listener(), self.run_upstream())?;
        Ok(())
    }

    async fn run_listener(&self) -> Result<(), std::io::Error> {
        let mut buf = [0u8; DNS_BUF_SIZE];

        loop {
            let (len, client) = self.listen_socket.recv_from(&mut buf).await?;
            let mut packet = buf[..len].to_vec();

            let question = match parse_question(&packet) {
                Ok(question) => question,
                Err(e) => {
                    warn!("dropping malformed DNS query from {}: {}", client, e);
                    continue;
                }
            };

            let matched =
                question.qtype == wire::TYPE_A && self.access_list.match_domain(&question.name);

            if matched {
                if let Some(reply) = self.local_reply(&packet, &question, client) {
                    if let Err(e) = self.listen_socket.send_to(&reply, client).await {
                        error!("DNS reply to {} failed: {}", client, e);
                    }
                    continue;
                }
            }

            let upstream = if matched {
                self.settings.specified_upstream
            } else {
                self.settings.default_upstream
            };

            let entry = InflightQuery {
                client,
                original_txid: question.txid,
                name: question.name.clone(),
                matched,
                inserted_at: Instant::now(),
            };
            let Some(internal_txid) = self.insert_inflight(entry) else {
                warn!("DNS in-flight table full, dropping query from {}", client);
                continue;
            };
            wire::rewrite_txid(&mut packet, internal_txid);

            debug!(
                "forwarding query for {} to {} ({})",
                question.name,
                upstream,
                if matched { "specified" } else { "default" }
            );
            if let Err(e) = self.upstream_socket.send_to(&packet, upstream).await {
                error!("upstream DNS send to {} failed: {}", upstream, e);
                self.take_inflight(internal_txid);
            }
        }
    }

    async fn run_upstream(&self) -> Result<(), std::io::Error> {
        let mut buf = [0u8; DNS_BUF_SIZE];

        loop {
            let (len, _from) = self.upstream_socket.recv_from(&mut buf).await?;
            let mut response = buf[..len].to_vec();

            let Some(internal_txid) = wire::extract_txid(&response) else {
                continue;
            };
            let Some(entry) = self.take_inflight(internal_txid) else {
                warn!(
                    "upstream DNS response with unknown txid {}, dropping",
                    internal_txid
                );
                continue;
            };
            wire::rewrite_txid(&mut response, entry.original_txid);

            if entry.matched {
                self.record_answers(&entry.name, &response);
            }

            if let Err(e) = self.listen_socket.send_to(&response, entry.client).await {
                error!("DNS relay to {} failed: {}", entry.client, e);
            }
        }
    }

    /// Answers a matched query locally when policy or the cache allows,
    /// returning the reply bytes to send.
    fn local_reply(
        &self,
        packet: &[u8],
        question: &Question,
        client: SocketAddr,
    ) -> Option<Vec<u8>> {
        if self.settings.public_service && !client.ip().is_loopback() {
            if let Some(sentinel) = self.settings.sentinel {
                debug!("sentinel answer for {} to {}", question.name, client);
                return Some(wire::build_answer(
                    packet,
                    question,
                    &[sentinel],
                    SENTINEL_TTL,
                ));
            }
        }

        let cached = self.forward.get(&question.name)?;
        debug!("cache answer for {}: {}", question.name, cached);
        self.kernel_set.install(cached, CACHED_REPLY_TTL);
        Some(wire::build_answer(
            packet,
            question,
            &[cached],
            CACHED_REPLY_TTL,
        ))
    }

    /// Harvests a matched response into the caches and the kernel set.
    fn record_answers(&self, qname: &str, response: &[u8]) {
        let records = match parse_answers(response) {
            Ok(records) => records,
            Err(e) => {
                warn!("unparseable answer section for {}: {}", qname, e);
                return;
            }
        };

        for (addr, ttl) in self.resolve_chain(qname, &records) {
            let ttl = Duration::from_secs(ttl.max(1) as u64);
            debug!("resolved {} -> {} (ttl {:?})", qname, addr, ttl);
            self.forward.insert(qname.to_string(), addr, ttl);
            self.reverse.insert(IpAddr::V4(addr), qname.to_string(), ttl);
            self.kernel_set.install(addr, ttl.as_secs() as u32);
        }
    }

    /// Collapses the CNAME chain of a response: every alias link is
    /// stored pointing at its final name (consulting links cached from
    /// earlier responses), then the addresses belonging to the queried
    /// name's final name are returned.
    fn resolve_chain(&self, qname: &str, records: &[Record]) -> Vec<(Ipv4Addr, u32)> {
        for record in records {
            if let Record::Cname { name, target, ttl } = record {
                let final_name = self.final_alias(target);
                self.aliases.insert(
                    name.clone(),
                    final_name,
                    Duration::from_secs((*ttl).max(1) as u64),
                );
            }
        }

        let final_name = self.final_alias(qname);
        records
            .iter()
            .filter_map(|record| match record {
                Record::A { name, addr, ttl } if *name == final_name => Some((*addr, *ttl)),
                _ => None,
            })
            .collect()
    }

    fn final_alias(&self, name: &str) -> String {
        let mut current = name.to_string();
        for _ in 0..MAX_ALIAS_HOPS {
            match self.aliases.get(&current) {
                Some(next) => current = next,
                None => break,
            }
        }
        current
    }

    fn insert_inflight(&self, entry: InflightQuery) -> Option<u16> {
        let mut inflight = self.inflight.lock().ok()?;
        let now = Instant::now();
        inflight.retain(|_, pending| {
            let alive = now.duration_since(pending.inserted_at) <= INFLIGHT_TTL;
            if !alive {
                warn!("upstream DNS timeout for {}", pending.name);
            }
            alive
        });

        let txid = (0..=u16::MAX as u32).find_map(|_| {
            let candidate = (self.next_txid.fetch_add(1, Ordering::Relaxed) & 0xFFFF) as u16;
            (!inflight.contains_key(&candidate)).then_some(candidate)
        })?;
        inflight.insert(txid, entry);
        Some(txid)
    }

    fn take_inflight(&self, txid: u16) -> Option<InflightQuery> {
        self.inflight.lock().ok()?.remove(&txid)
    }

    /// Drops expired cache entries. Called periodically from the proxy's
    /// housekeeping task.
    pub fn purge(&self) {
        self.forward.purge_expired();
        self.reverse.purge_expired();
        self.aliases.purge_expired();
    }
}

#[cfg(test)]
mod tests {
    use super::ipset::testing::RecordingSet;
    use super::*;
    use crate::access::{AccessList, AccessListConfig};

    fn matched_list(domains: &[&str]) -> Arc<AccessList> {
        let config = AccessListConfig {
            domains: domains.iter().map(|d| d.to_string()).collect(),
            subnets: Vec::new(),
        };
        Arc::new(AccessList::new(&config).unwrap())
    }

    async fn forwarder_pair(
        domains: &[&str],
        public_service: bool,
        sentinel: Option<Ipv4Addr>,
    ) -> (Arc<DnsForwarder>, UdpSocket, UdpSocket, Arc<RecordingSet>) {
        let specified = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let default = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let kernel_set = Arc::new(RecordingSet::default());
        let settings = DnsSettings {
            listen: "127.0.0.1:0".parse().unwrap(),
            default_upstream: default.local_addr().unwrap(),
            specified_upstream: specified.local_addr().unwrap(),
            public_service,
            sentinel,
        };
        let forwarder = Arc::new(
            DnsForwarder::bind(settings, matched_list(domains), kernel_set.clone())
                .await
                .unwrap(),
        );
        let runner = forwarder.clone();
        tokio::spawn(async move {
            let _ = runner.run().await;
        });
        (forwarder, specified, default, kernel_set)
    }

    fn answer_for(query: &[u8], addr: Ipv4Addr, ttl: u32) -> Vec<u8> {
        let question = parse_question(query).unwrap();
        wire::build_answer(query, &question, &[addr], ttl)
    }

    /// Matched queries go to the specified upstream with a rewritten
    /// txid; the relayed reply restores the client's txid, populates
    /// both caches and the kernel set, and the next identical query is
    /// served locally.
    #[tokio::test]
    async fn split_forwarding_and_caching() {
        let (forwarder, specified, _default, kernel_set) =
            forwarder_pair(&["example.com"], false, None).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let listen = forwarder.local_addr().unwrap();
        let resolved = Ipv4Addr::new(203, 0, 113, 9);

        let query = wire::build_query(0x5555, "www.example.com", wire::TYPE_A);
        client.send_to(&query, listen).await.unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, from) = specified.recv_from(&mut buf).await.unwrap();
        let forwarded = &buf[..len];
        assert_ne!(wire::extract_txid(forwarded), Some(0x5555));

        let reply = answer_for(forwarded, resolved, 300);
        specified.send_to(&reply, from).await.unwrap();

        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(wire::extract_txid(&buf[..len]), Some(0x5555));
        let records = parse_answers(&buf[..len]).unwrap();
        assert!(matches!(records[0], Record::A { addr, .. } if addr == resolved));

        assert_eq!(
            forwarder.get_domain(IpAddr::V4(resolved)).as_deref(),
            Some("www.example.com")
        );
        assert_eq!(
            kernel_set.installed.lock().unwrap().first(),
            Some(&(resolved, 300))
        );

        // Second query: answered from the cache, nothing forwarded.
        client.send_to(&query, listen).await.unwrap();
        let (len, _) = client.recv_from(&mut buf).await.unwrap();
        let records = parse_answers(&buf[..len]).unwrap();
        assert!(
            matches!(records[0], Record::A { addr, ttl, .. } if addr == resolved && ttl == CACHED_REPLY_TTL)
        );
        let mut probe = [0u8; 16];
        let timed_out = tokio::time::timeout(
            Duration::from_millis(100),
            specified.recv_from(&mut probe),
        )
        .await;
        assert!(timed_out.is_err(), "cache hit must not reach the upstream");
    }

    /// Unmatched names go to the default upstream.
    #[tokio::test]
    async fn unmatched_uses_default_upstream() {
        let (forwarder, _specified, default, _) =
            forwarder_pair(&["example.com"], false, None).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let query = wire::build_query(1, "other.net", wire::TYPE_A);
        client
            .send_to(&query, forwarder.local_addr().unwrap())
            .await
            .unwrap();

        let mut buf = [0u8; DNS_BUF_SIZE];
        let (len, _) = default.recv_from(&mut buf).await.unwrap();
        let question = parse_question(&buf[..len]).unwrap();
        assert_eq!(question.name, "other.net");
    }

    /// Collapsing a CNAME chain credits the queried name with the final
    /// A records, including links cached from an earlier response.
    #[tokio::test]
    async fn cname_chain_collapse() {
        let (forwarder, ..) = forwarder_pair(&["example.com"], false, None).await;
        let addr = Ipv4Addr::new(198, 51, 100, 4);

        let records = vec![
            Record::Cname {
                name: "a.example.com".into(),
                target: "b.example.com".into(),
                ttl: 60,
            },
            Record::Cname {
                name: "b.example.com".into(),
                target: "c.example.com".into(),
                ttl: 60,
            },
            Record::A {
                name: "c.example.com".into(),
                addr,
                ttl: 60,
            },
        ];
        let resolved = forwarder.resolve_chain("a.example.com", &records);
        assert_eq!(resolved, vec![(addr, 60)]);

        // A later response linking into the stored chain collapses to
        // the same final name.
        let later = vec![Record::Cname {
            name: "alias.example.com".into(),
            target: "a.example.com".into(),
            ttl: 60,
        }];
        forwarder.resolve_chain("alias.example.com", &later);
        assert_eq!(forwarder.final_alias("alias.example.com"), "c.example.com");
    }

    /// With public service enabled, a matched query from a non-loopback
    /// client gets the sentinel answer without touching an upstream.
    #[tokio::test]
    async fn sentinel_for_public_clients() {
        let (forwarder, ..) =
            forwarder_pair(&["example.com"], true, Some(Ipv4Addr::new(10, 1, 2, 3))).await;
        let query = wire::build_query(7, "example.com", wire::TYPE_A);
        let question = parse_question(&query).unwrap();

        let public_client: SocketAddr = "192.0.2.50:5353".parse().unwrap();
        let reply = forwarder.local_reply(&query, &question, public_client).unwrap();
        let records = parse_answers(&reply).unwrap();
        assert!(matches!(
            records[0],
            Record::A { addr, ttl, .. } if addr == Ipv4Addr::new(10, 1, 2, 3) && ttl == SENTINEL_TTL
        ));

        // Loopback clients are forwarded normally (no cache, no reply).
        let local_client: SocketAddr = "127.0.0.1:5353".parse().unwrap();
        assert!(forwarder.local_reply(&query, &question, local_client).is_none());
    }
}
