//! Non-destructive protocol sniffing.
//!
//! Filters recover an application-layer hostname from the first bytes
//! of a stream without disturbing it: inspection happens on peeked
//! bytes, and anything a filter commits is handed back as a replay
//! buffer so the upstream sees an identical byte stream.

mod http;
pub mod reader;
mod tls;

use std::collections::HashMap;

use thiserror::Error;
use tokio::io::AsyncRead;
use tracing::{debug, trace};

pub use reader::{PeekReader, MAX_PEEK};

/// Re-invocations of a filter returning `Again` before giving up on a
/// stream that never supplies the promised bytes.
const MAX_REFILLS: usize = 32;

#[derive(Debug, Error)]
pub enum SniffError {
    #[error("read error while sniffing: {0}")]
    Io(#[from] std::io::Error),
    #[error("invalid http request: {0}")]
    Http(httparse::Error),
    #[error("http request carries no Host header")]
    MissingHost,
    #[error("malformed ClientHello: {0}")]
    MalformedClientHello(&'static str),
    #[error("no server name in ClientHello")]
    SniNotFound,
    #[error("stream ended before the sniffed record completed")]
    Truncated,
    #[error("sniff buffer limit exceeded")]
    Oversized,
}

/// One inspection step over the currently buffered bytes.
///
/// `Continue` means "not this protocol", `Again(n)` means "re-invoke
/// once at least n bytes are buffered", `Stop` carries the extracted
/// hostname plus the number of bytes the filter committed, and `Fail`
/// is a terminal parse failure for this connection.
#[derive(Debug)]
pub enum FilterStep {
    Continue,
    Again(usize),
    Stop { host: String, consumed: usize },
    Fail(SniffError),
}

/// Named filters the port table can reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    Http,
    Tls,
}

impl FilterKind {
    pub fn by_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "http" => Some(Self::Http),
            "tls" => Some(Self::Tls),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tls => "tls",
        }
    }

    fn inspect(&self, buf: &[u8]) -> FilterStep {
        match self {
            Self::Http => http::inspect(buf),
            Self::Tls => tls::inspect(buf),
        }
    }
}

/// Result of running the filter chain over a connection prefix.
#[derive(Debug, Default)]
pub struct Sniffed {
    /// Extracted hostname, if the port's filter recognized the payload.
    pub host: Option<String>,
    /// Bytes the filter committed while parsing; the pipeline must
    /// write these to the upstream before the remaining stream.
    pub replay: Vec<u8>,
}

/// Port-keyed filter table. At most one filter per destination port.
#[derive(Debug, Default)]
pub struct Filters {
    table: HashMap<u16, FilterKind>,
}

#[derive(Debug, Error)]
#[error("a filter is already registered for port {0}")]
pub struct FilterExists(pub u16);

impl Filters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a filter for a destination port.
    pub fn add(&mut self, kind: FilterKind, port: u16) -> Result<(), FilterExists> {
        if self.table.contains_key(&port) {
            return Err(FilterExists(port));
        }
        debug!("registered {} filter for port {}", kind.name(), port);
        self.table.insert(port, kind);
        Ok(())
    }

    /// Removes the filter for a port, if any.
    pub fn remove(&mut self, port: u16) -> Option<FilterKind> {
        self.table.remove(&port)
    }

    pub fn has_filter(&self, port: u16) -> bool {
        self.table.contains_key(&port)
    }

    /// Runs the filter registered for `port` against the stream prefix.
    ///
    /// `Continue` and a missing registration both yield an empty
    /// [`Sniffed`]; the caller falls back to whatever destination it
    /// already had. Parse failures and I/O errors are returned, and the
    /// refill loop bounds how much a slow-drip client can make us
    /// buffer.
    pub async fn exec<R: AsyncRead + Unpin>(
        &self,
        reader: &mut PeekReader<R>,
        port: u16,
    ) -> Result<Sniffed, SniffError> {
        let Some(kind) = self.table.get(&port) else {
            return Ok(Sniffed::default());
        };

        let mut need = 1;
        for _ in 0..MAX_REFILLS {
            if need > MAX_PEEK {
                return Err(SniffError::Oversized);
            }
            let buffered = reader.peek(need).await?;

            match kind.inspect(buffered) {
                FilterStep::Continue => {
                    trace!("port {}: payload is not {}", port, kind.name());
                    return Ok(Sniffed::default());
                }
                FilterStep::Stop { host, consumed } => {
                    debug!("port {}: {} filter extracted host {}", port, kind.name(), host);
                    reader.consume(consumed);
                    return Ok(Sniffed {
                        host: Some(host),
                        replay: reader.take_replay(),
                    });
                }
                FilterStep::Again(n) => {
                    if reader.saw_eof() && reader.buffered().len() < n {
                        return Err(SniffError::Truncated);
                    }
                    need = n.max(need + 1);
                }
                FilterStep::Fail(err) => return Err(err),
            }
        }

        Err(SniffError::Oversized)
    }
}
