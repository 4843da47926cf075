//! Server side of a minimal SOCKS5 handshake (RFC 1928): no authentication,
//! CONNECT only.

use std::net::{Ipv4Addr, Ipv6Addr};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{AppError, Result};

const VERSION: u8 = 0x05;
const NO_AUTH: u8 = 0x00;
const NO_ACCEPTABLE_METHOD: u8 = 0xff;
const CMD_CONNECT: u8 = 0x01;

const ATYP_IPV4: u8 = 0x01;
const ATYP_DOMAIN: u8 = 0x03;
const ATYP_IPV6: u8 = 0x04;

pub const REPLY_SUCCEEDED: u8 = 0x00;
pub const REPLY_GENERAL_FAILURE: u8 = 0x01;
pub const REPLY_COMMAND_NOT_SUPPORTED: u8 = 0x07;
pub const REPLY_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

fn protocol_error(msg: impl Into<String>) -> AppError {
    AppError::InvalidArgument(format!("socks5: {}", msg.into()))
}

/// Run the greeting and request phases and return the requested target.
///
/// The caller must answer with [`reply`] once it knows whether the target is
/// reachable.
pub async fn accept<S>(stream: &mut S) -> Result<(String, u16)>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut head = [0u8; 2];
    stream.read_exact(&mut head).await?;
    if head[0] != VERSION {
        return Err(protocol_error(format!("unsupported version {}", head[0])));
    }

    let mut methods = vec![0u8; head[1] as usize];
    stream.read_exact(&mut methods).await?;
    if !methods.contains(&NO_AUTH) {
        stream.write_all(&[VERSION, NO_ACCEPTABLE_METHOD]).await?;
        return Err(protocol_error("client requires authentication"));
    }
    stream.write_all(&[VERSION, NO_AUTH]).await?;

    let mut request = [0u8; 4];
    stream.read_exact(&mut request).await?;
    if request[0] != VERSION {
        return Err(protocol_error(format!("unsupported version {}", request[0])));
    }
    if request[1] != CMD_CONNECT {
        reply(stream, REPLY_COMMAND_NOT_SUPPORTED).await?;
        return Err(protocol_error(format!("unsupported command {}", request[1])));
    }

    let host = match request[3] {
        ATYP_IPV4 => {
            let mut octets = [0u8; 4];
            stream.read_exact(&mut octets).await?;
            Ipv4Addr::from(octets).to_string()
        }
        ATYP_DOMAIN => {
            let mut len = [0u8; 1];
            stream.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            stream.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| protocol_error("domain name is not UTF-8"))?
        }
        ATYP_IPV6 => {
            let mut octets = [0u8; 16];
            stream.read_exact(&mut octets).await?;
            Ipv6Addr::from(octets).to_string()
        }
        other => {
            reply(stream, REPLY_ADDRESS_NOT_SUPPORTED).await?;
            return Err(protocol_error(format!("unsupported address type {other}")));
        }
    };

    let mut port = [0u8; 2];
    stream.read_exact(&mut port).await?;
    Ok((host, u16::from_be_bytes(port)))
}

/// Send a reply with an unspecified bound address.
pub async fn reply<S>(stream: &mut S, code: u8) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    stream
        .write_all(&[VERSION, code, 0x00, ATYP_IPV4, 0, 0, 0, 0, 0, 0])
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_domain_connect() {
        let (mut client, mut server) = tokio::io::duplex(256);

        let handle = tokio::spawn(async move {
            let target = accept(&mut server).await.unwrap();
            reply(&mut server, REPLY_SUCCEEDED).await.unwrap();
            target
        });

        client.write_all(&[5, 1, 0]).await.unwrap();
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, 0]);

        let mut request = vec![5, 1, 0, 3, 8];
        request.extend_from_slice(b"db.local");
        request.extend_from_slice(&5432u16.to_be_bytes());
        client.write_all(&request).await.unwrap();

        let mut answer = [0u8; 10];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[1], REPLY_SUCCEEDED);
        assert_eq!(handle.await.unwrap(), ("db.local".to_string(), 5432));
    }

    #[tokio::test]
    async fn test_ipv4_and_ipv6_targets() {
        for (atyp, addr, expected) in [
            (ATYP_IPV4, vec![10, 0, 0, 7], "10.0.0.7".to_string()),
            (ATYP_IPV6, Ipv6Addr::LOCALHOST.octets().to_vec(), "::1".to_string()),
        ] {
            let (mut client, mut server) = tokio::io::duplex(256);
            let mut bytes = vec![5, 1, 0, 5, 1, 0, atyp];
            bytes.extend_from_slice(&addr);
            bytes.extend_from_slice(&80u16.to_be_bytes());
            client.write_all(&bytes).await.unwrap();

            let target = accept(&mut server).await.unwrap();
            assert_eq!(target, (expected, 80));
        }
    }

    #[tokio::test]
    async fn test_rejects_auth_only_clients() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client.write_all(&[5, 1, 2]).await.unwrap();

        assert!(accept(&mut server).await.is_err());
        let mut choice = [0u8; 2];
        client.read_exact(&mut choice).await.unwrap();
        assert_eq!(choice, [5, NO_ACCEPTABLE_METHOD]);
    }

    #[tokio::test]
    async fn test_rejects_bind_command() {
        let (mut client, mut server) = tokio::io::duplex(256);
        client
            .write_all(&[5, 1, 0, 5, 2, 0, 1, 127, 0, 0, 1, 0, 80])
            .await
            .unwrap();

        assert!(accept(&mut server).await.is_err());
        let mut answer = [0u8; 12];
        client.read_exact(&mut answer).await.unwrap();
        assert_eq!(answer[2..4], [5, REPLY_COMMAND_NOT_SUPPORTED]);
    }
}
