use std::collections::HashSet;
use std::net::IpAddr;
use std::sync::RwLock;

use ipnetwork::IpNetwork;
use tracing::debug;

use super::config::{AccessListConfig, AccessListError};

/// Concurrent domain-suffix and subnet membership index.
///
/// Lookups take a shared lock, mutation an exclusive one; a reader
/// always observes either the pre- or post-mutation state. The list
/// lives for the process lifetime and is shared via `Arc`.
pub struct AccessList {
    inner: RwLock<Inner>,
}

struct Inner {
    /// Canonical domain suffixes, trailing dot stripped.
    domains: HashSet<String>,
    subnets: Vec<IpNetwork>,
}

fn canonical(name: &str) -> &str {
    name.strip_suffix('.').unwrap_or(name)
}

impl AccessList {
    /// Builds an access list from a parsed config. A malformed CIDR is
    /// an error, not a skipped entry.
    pub fn new(config: &AccessListConfig) -> Result<Self, AccessListError> {
        let domains = config
            .domains
            .iter()
            .map(|d| canonical(d).to_lowercase())
            .collect();

        let mut subnets = Vec::with_capacity(config.subnets.len());
        for subnet in &config.subnets {
            let network = subnet
                .parse::<IpNetwork>()
                .map_err(|_| AccessListError::InvalidCidr(subnet.clone()))?;
            subnets.push(network);
        }

        Ok(Self {
            inner: RwLock::new(Inner { domains, subnets }),
        })
    }

    /// Creates an empty list (matches nothing).
    pub fn empty() -> Self {
        Self {
            inner: RwLock::new(Inner {
                domains: HashSet::new(),
                subnets: Vec::new(),
            }),
        }
    }

    /// Checks whether a name, or any right-hand dot-suffix of it, is
    /// registered. One trailing dot is stripped first, so the rooted
    /// form DNS uses ("example.com.") matches the registered
    /// "example.com".
    pub fn match_domain(&self, name: &str) -> bool {
        let name = canonical(name).to_lowercase();
        let Ok(inner) = self.inner.read() else {
            return false;
        };

        let mut rest = name.as_str();
        loop {
            if inner.domains.contains(rest) {
                return true;
            }
            match rest.split_once('.') {
                Some((_, suffix)) => rest = suffix,
                None => return false,
            }
        }
    }

    /// Checks whether an IP falls in any registered subnet.
    pub fn match_ip(&self, ip: IpAddr) -> bool {
        let Ok(inner) = self.inner.read() else {
            return false;
        };
        inner.subnets.iter().any(|subnet| subnet.contains(ip))
    }

    /// Adds a domain suffix.
    pub fn add_domain(&self, domain: &str) {
        if let Ok(mut inner) = self.inner.write() {
            debug!("access list: add domain {}", domain);
            inner.domains.insert(canonical(domain).to_lowercase());
        }
    }

    /// Removes a domain suffix.
    pub fn delete_domain(&self, domain: &str) {
        if let Ok(mut inner) = self.inner.write() {
            debug!("access list: delete domain {}", domain);
            inner.domains.remove(&canonical(domain).to_lowercase());
        }
    }

    /// Adds a subnet given in CIDR notation.
    pub fn add_subnet(&self, subnet: &str) -> Result<(), AccessListError> {
        let network = subnet
            .parse::<IpNetwork>()
            .map_err(|_| AccessListError::InvalidCidr(subnet.to_string()))?;
        if let Ok(mut inner) = self.inner.write() {
            debug!("access list: add subnet {}", network);
            inner.subnets.push(network);
        }
        Ok(())
    }

    /// Removes a subnet given in CIDR notation.
    pub fn delete_subnet(&self, subnet: &str) -> Result<(), AccessListError> {
        let network = subnet
            .parse::<IpNetwork>()
            .map_err(|_| AccessListError::InvalidCidr(subnet.to_string()))?;
        if let Ok(mut inner) = self.inner.write() {
            debug!("access list: delete subnet {}", network);
            inner.subnets.retain(|n| *n != network);
        }
        Ok(())
    }

    /// Replaces the whole list with a freshly loaded config. Used by the
    /// hot-reload path so in-flight lookups see either the old or the
    /// new list, never a mix.
    pub fn replace(&self, config: &AccessListConfig) -> Result<(), AccessListError> {
        let fresh = AccessList::new(config)?;
        let fresh = fresh
            .inner
            .into_inner()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Ok(mut inner) = self.inner.write() {
            *inner = fresh;
        }
        Ok(())
    }

    /// Number of registered domain suffixes.
    pub fn domain_count(&self) -> usize {
        self.inner.read().map(|i| i.domains.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for AccessList {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.inner.read() {
            Ok(inner) => f
                .debug_struct("AccessList")
                .field("domains", &inner.domains.len())
                .field("subnets", &inner.subnets.len())
                .finish(),
            Err(_) => f.debug_struct("AccessList").finish_non_exhaustive(),
        }
    }
}
