//! SOCKS5 handshake (RFC 1928 subset: no auth, CONNECT only).
//!
//! [`read_connect`] performs method negotiation and parses the CONNECT
//! request, returning the target without sending the final reply; the
//! session sends success or failure once the upstream dial settles, so a
//! connection sees exactly one reply. Malformed input gets the failure
//! reply here before the error is returned.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{CoreError, Result};

pub const REPLY_SUCCESS: [u8; 10] = [0x05, 0x00, 0x00, 0x01, 0, 0, 0, 0, 0, 0];
pub const REPLY_FAILURE: [u8; 10] = [0x05, 0x01, 0x00, 0x01, 0, 0, 0, 0, 0, 0];

const VERSION: u8 = 0x05;
const CMD_CONNECT: u8 = 0x01;
const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

/// Negotiate methods and read the CONNECT target `(host, port)`.
pub async fn read_connect<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match parse_connect(stream).await {
        Ok(target) => Ok(target),
        Err(e) => {
            let _ = stream.write_all(&REPLY_FAILURE).await;
            Err(e)
        }
    }
}

async fn parse_connect<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    // greeting: [ver, nmethods] + methods
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(CoreError::InvalidRequest(format!(
            "socks5: unsupported version {:#04x}",
            head[0]
        )));
    }
    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;

    // no-auth accepted regardless of offered methods
    stream.write_all(&[VERSION, 0x00]).await?;

    // request: [ver, cmd, rsv, atyp]
    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(CoreError::InvalidRequest(format!(
            "socks5: unsupported request version {:#04x}",
            request[0]
        )));
    }
    if request[1] != CMD_CONNECT {
        return Err(CoreError::InvalidRequest(format!(
            "socks5: unsupported command {:#04x}",
            request[1]
        )));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut addr = [0u8; 4];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv4Addr::from(addr).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut domain = vec![0u8; len[0] as usize];
            stream.read_exact(&mut domain).await?;
            String::from_utf8(domain).map_err(|_| {
                CoreError::InvalidRequest("socks5: domain name is not valid UTF-8".to_string())
            })?
        }
        ATYP_IPV6 => {
            let mut addr = [0u8; 16];
            stream.read_exact(&mut addr).await?;
            std::net::Ipv6Addr::from(addr).to_string()
        }
        atyp => {
            return Err(CoreError::InvalidRequest(format!(
                "socks5: unsupported address type {:#04x}",
                atyp
            )));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}
