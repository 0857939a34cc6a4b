//! Split-tunneling proxy with split-horizon DNS.
//!
//! Traffic whose destination is on a configured access list is carried
//! through an obfuscated tunnel to an upstream peer; everything else
//! goes out directly. Targets are recovered three ways, depending on
//! the mode:
//!
//! - `transparent`: redirected connections, with the destination name
//!   recovered from the DNS forwarder's reverse cache
//! - `socks-local`: a local SOCKS5 listener
//! - `socks-server`: the upstream end of the tunnel
//!
//! Connections whose destination is only known by address are sniffed
//! non-destructively for an HTTP Host header or a TLS SNI before they
//! are classified.

pub mod access;
pub mod config;
pub mod dns;
pub mod proxy;
pub mod reload;
pub mod sniff;
pub mod stream;
pub mod tunnel;

pub use access::{AccessList, AccessListConfig, AccessListError};
pub use config::{Config, ConfigError, Mode};
pub use dns::{DnsForwarder, DnsSettings};
pub use proxy::{Proxy, ProxyError};
pub use stream::IdleTimeoutStream;
pub use tunnel::{Dialer, Reception, TargetAddr, TunnelError};
