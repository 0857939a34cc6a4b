//! Minimal SOCKS5 server side (RFC 1928): no-auth negotiation and the
//! CONNECT command only.

use async_trait::async_trait;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::debug;

use crate::stream::IdleTimeoutStream;
use crate::tunnel::{addr, ProxyStream, Reception, TargetAddr, TunnelError};

const SOCKS_VERSION: u8 = 0x05;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_NO_ACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;
const REPLY_SUCCEEDED: u8 = 0x00;
const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;

#[derive(Default)]
pub struct Socks5Reception;

#[async_trait]
impl Reception for Socks5Reception {
    async fn recept(
        &self,
        mut stream: IdleTimeoutStream<TcpStream>,
    ) -> Result<(TargetAddr, ProxyStream), TunnelError> {
        let version = stream.read_u8().await?;
        if version != SOCKS_VERSION {
            return Err(TunnelError::SocksVersion(version));
        }
        let nmethods = stream.read_u8().await? as usize;
        let mut methods = vec![0u8; nmethods];
        stream.read_exact(&mut methods).await?;
        if !methods.contains(&METHOD_NO_AUTH) {
            stream
                .write_all(&[SOCKS_VERSION, METHOD_NO_ACCEPTABLE])
                .await?;
            return Err(TunnelError::SocksVersion(version));
        }
        stream.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;

        let mut request = [0u8; 3];
        stream.read_exact(&mut request).await?;
        if request[0] != SOCKS_VERSION {
            return Err(TunnelError::SocksVersion(request[0]));
        }
        if request[1] != CMD_CONNECT {
            // BND fields are zero in error replies too.
            stream
                .write_all(&[
                    SOCKS_VERSION,
                    REPLY_COMMAND_NOT_SUPPORTED,
                    0,
                    addr::ATYP_IPV4,
                    0,
                    0,
                    0,
                    0,
                    0,
                    0,
                ])
                .await?;
            return Err(TunnelError::SocksCommand(request[1]));
        }

        let target = addr::read_target(&mut stream).await?;
        debug!("socks5 connect request for {}", target);
        stream
            .write_all(&[
                SOCKS_VERSION,
                REPLY_SUCCEEDED,
                0,
                addr::ATYP_IPV4,
                0,
                0,
                0,
                0,
                0,
                0,
            ])
            .await?;
        Ok((target, Box::new(stream)))
    }
}
