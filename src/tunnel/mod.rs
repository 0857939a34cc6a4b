//! Tunnel transports: how a classified connection reaches its target.
//!
//! A [`Reception`] turns an accepted connection into a target address
//! plus the stream to serve; a [`Dialer`] opens the upstream leg. Both
//! are trait objects so each proxy mode wires its own combination.

pub mod addr;
pub mod crypto;
pub mod direct;
pub mod normal;
pub mod pac;

use std::fmt;
use std::net::IpAddr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::stream::IdleTimeoutStream;

pub use crypto::{decode_key, CryptoDialer, CryptoReception, CryptoStream};
pub use direct::DirectDialer;
pub use normal::{NormalDialer, NormalReception};
pub use pac::PacDialer;

#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("tunnel i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid tunnel key: {0}")]
    InvalidKey(String),
    #[error("target {0} not on the access list")]
    NotMatched(String),
    #[error("unknown address type {0:#04x}")]
    UnknownAddressType(u8),
    #[error("target carries neither name nor address")]
    EmptyTarget,
    #[error("unsupported SOCKS version {0}")]
    SocksVersion(u8),
    #[error("unsupported SOCKS command {0}")]
    SocksCommand(u8),
}

/// Where a proxied connection wants to go. Carries the name when one is
/// known (needed for classification) and the address when one is known
/// (needed without a resolver).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetAddr {
    pub fqdn: Option<String>,
    pub ip: Option<IpAddr>,
    pub port: u16,
}

impl TargetAddr {
    pub fn from_domain(fqdn: impl Into<String>, port: u16) -> Self {
        Self {
            fqdn: Some(fqdn.into()),
            ip: None,
            port,
        }
    }

    pub fn from_ip(ip: IpAddr, port: u16) -> Self {
        Self {
            fqdn: None,
            ip: Some(ip),
            port,
        }
    }

    /// Host part for dialing or logging, preferring the name.
    pub fn host(&self) -> Result<String, TunnelError> {
        if let Some(fqdn) = &self.fqdn {
            return Ok(fqdn.clone());
        }
        match self.ip {
            Some(ip) => Ok(ip.to_string()),
            None => Err(TunnelError::EmptyTarget),
        }
    }
}

impl fmt::Display for TargetAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.fqdn, self.ip) {
            (Some(fqdn), _) => write!(f, "{}:{}", fqdn, self.port),
            (None, Some(IpAddr::V6(ip))) => write!(f, "[{}]:{}", ip, self.port),
            (None, Some(ip)) => write!(f, "{}:{}", ip, self.port),
            (None, None) => write!(f, "<empty>:{}", self.port),
        }
    }
}

/// Object-safe bound for the streams the pipeline shuffles around.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> AsyncStream for T {}

pub type ProxyStream = Box<dyn AsyncStream>;

/// Opens the upstream leg for a target.
#[async_trait]
pub trait Dialer: Send + Sync {
    async fn dial(&self, target: &TargetAddr) -> Result<ProxyStream, TunnelError>;
}

/// Extracts the target from an accepted connection and returns the
/// stream the pipeline should serve (possibly a wrapped one). The
/// connection arrives under its idle deadline so a silent peer cannot
/// stall the handshake.
#[async_trait]
pub trait Reception: Send + Sync {
    async fn recept(
        &self,
        stream: IdleTimeoutStream<TcpStream>,
    ) -> Result<(TargetAddr, ProxyStream), TunnelError>;
}
