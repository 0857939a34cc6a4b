//! Wire codec for target addresses, shared by the tunnel handshake and
//! the SOCKS5 reception: a type byte, the address, then a big-endian
//! port.

use std::net::IpAddr;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{TargetAddr, TunnelError};

pub const ATYP_IPV4: u8 = 0x01;
pub const ATYP_DOMAIN: u8 = 0x03;
pub const ATYP_IPV6: u8 = 0x04;

/// Writes a target address record. Names are preferred over addresses
/// so the receiving side can still classify by domain.
pub async fn write_target<W: AsyncWrite + Unpin>(
    writer: &mut W,
    target: &TargetAddr,
) -> Result<(), TunnelError> {
    if let Some(fqdn) = &target.fqdn {
        let name = fqdn.as_bytes();
        if name.is_empty() || name.len() > 255 {
            return Err(TunnelError::EmptyTarget);
        }
        writer.write_u8(ATYP_DOMAIN).await?;
        writer.write_u8(name.len() as u8).await?;
        writer.write_all(name).await?;
    } else {
        match target.ip {
            Some(IpAddr::V4(ip)) => {
                writer.write_u8(ATYP_IPV4).await?;
                writer.write_all(&ip.octets()).await?;
            }
            Some(IpAddr::V6(ip)) => {
                writer.write_u8(ATYP_IPV6).await?;
                writer.write_all(&ip.octets()).await?;
            }
            None => return Err(TunnelError::EmptyTarget),
        }
    }
    writer.write_u16(target.port).await?;
    Ok(())
}

/// Reads a target address record written by [`write_target`] (or a
/// SOCKS5 client).
pub async fn read_target<R: AsyncRead + Unpin>(reader: &mut R) -> Result<TargetAddr, TunnelError> {
    let atyp = reader.read_u8().await?;
    let mut target = match atyp {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            reader.read_exact(&mut octets).await?;
            TargetAddr::from_ip(IpAddr::from(octets), 0)
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            reader.read_exact(&mut octets).await?;
            TargetAddr::from_ip(IpAddr::from(octets), 0)
        }
        ATYP_DOMAIN => {
            let len = reader.read_u8().await? as usize;
            let mut name = vec![0u8; len];
            reader.read_exact(&mut name).await?;
            let name = String::from_utf8(name)
                .map_err(|_| TunnelError::UnknownAddressType(ATYP_DOMAIN))?;
            TargetAddr::from_domain(name, 0)
        }
        other => return Err(TunnelError::UnknownAddressType(other)),
    };
    target.port = reader.read_u16().await?;
    Ok(target)
}
