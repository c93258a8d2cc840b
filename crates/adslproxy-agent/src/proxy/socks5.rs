//! Minimal SOCKS5 proxy (RFC 1928), CONNECT command only, with optional
//! username/password authentication (RFC 1929).

use super::ProxyCredential;
use adslproxy_core::splice;
use std::io;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const SOCKS_VERSION: u8 = 5;
const METHOD_NO_AUTH: u8 = 0x00;
const METHOD_USERPASS: u8 = 0x02;
const METHOD_UNACCEPTABLE: u8 = 0xFF;
const CMD_CONNECT: u8 = 0x01;

const REP_SUCCESS: u8 = 0x00;
const REP_CONNECTION_REFUSED: u8 = 0x05;
const REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;
const REP_ADDRESS_NOT_SUPPORTED: u8 = 0x08;

/// Bind the proxy on an ephemeral localhost port and serve in the
/// background. Returns the bound address.
pub async fn spawn(credential: Option<ProxyCredential>) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let credential = credential.map(Arc::new);
    info!(addr = %addr, "socks5 proxy listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    let credential = credential.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(conn, credential).await {
                            debug!(error = %e, "socks5 connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "socks5 accept failed");
                    break;
                }
            }
        }
    });

    Ok(addr)
}

async fn handle(mut conn: TcpStream, credential: Option<Arc<ProxyCredential>>) -> io::Result<()> {
    negotiate_method(&mut conn, credential.as_deref()).await?;

    let mut request = [0u8; 4];
    conn.read_exact(&mut request).await?;
    let [version, command, _reserved, atyp] = request;
    if version != SOCKS_VERSION {
        return Err(bad_data("bad socks version"));
    }
    if command != CMD_CONNECT {
        reply(&mut conn, REP_COMMAND_NOT_SUPPORTED).await?;
        return Ok(());
    }

    let target = match read_target(&mut conn, atyp).await {
        Ok(target) => target,
        Err(e) => {
            reply(&mut conn, REP_ADDRESS_NOT_SUPPORTED).await?;
            return Err(e);
        }
    };

    match TcpStream::connect(&target).await {
        Ok(upstream) => {
            reply(&mut conn, REP_SUCCESS).await?;
            splice(conn, upstream).await?;
            Ok(())
        }
        Err(e) => {
            debug!(target = %target, error = %e, "socks5 connect failed");
            reply(&mut conn, REP_CONNECTION_REFUSED).await?;
            Ok(())
        }
    }
}

async fn negotiate_method(
    conn: &mut TcpStream,
    credential: Option<&ProxyCredential>,
) -> io::Result<()> {
    let mut greeting = [0u8; 2];
    conn.read_exact(&mut greeting).await?;
    if greeting[0] != SOCKS_VERSION {
        return Err(bad_data("bad socks version"));
    }

    let mut methods = vec![0u8; greeting[1] as usize];
    conn.read_exact(&mut methods).await?;

    let Some(credential) = credential else {
        if !methods.contains(&METHOD_NO_AUTH) {
            conn.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
            return Err(bad_data("no acceptable auth method"));
        }
        conn.write_all(&[SOCKS_VERSION, METHOD_NO_AUTH]).await?;
        return Ok(());
    };

    if !methods.contains(&METHOD_USERPASS) {
        conn.write_all(&[SOCKS_VERSION, METHOD_UNACCEPTABLE]).await?;
        return Err(bad_data("client does not offer username/password"));
    }
    conn.write_all(&[SOCKS_VERSION, METHOD_USERPASS]).await?;

    // RFC 1929 subnegotiation.
    let mut header = [0u8; 2];
    conn.read_exact(&mut header).await?;
    let mut username = vec![0u8; header[1] as usize];
    conn.read_exact(&mut username).await?;

    let mut pass_len = [0u8; 1];
    conn.read_exact(&mut pass_len).await?;
    let mut password = vec![0u8; pass_len[0] as usize];
    conn.read_exact(&mut password).await?;

    let ok = username == credential.username.as_bytes()
        && password == credential.password.as_bytes();
    conn.write_all(&[0x01, if ok { 0x00 } else { 0x01 }]).await?;
    if !ok {
        return Err(bad_data("bad proxy credentials"));
    }
    Ok(())
}

async fn read_target(conn: &mut TcpStream, atyp: u8) -> io::Result<String> {
    let host = match atyp {
        0x01 => {
            let mut addr = [0u8; 4];
            conn.read_exact(&mut addr).await?;
            Ipv4Addr::from(addr).to_string()
        }
        0x04 => {
            let mut addr = [0u8; 16];
            conn.read_exact(&mut addr).await?;
            format!("[{}]", Ipv6Addr::from(addr))
        }
        0x03 => {
            let mut len = [0u8; 1];
            conn.read_exact(&mut len).await?;
            let mut name = vec![0u8; len[0] as usize];
            conn.read_exact(&mut name).await?;
            String::from_utf8(name).map_err(|_| bad_data("bad domain name"))?
        }
        _ => return Err(bad_data("unsupported address type")),
    };

    let mut port = [0u8; 2];
    conn.read_exact(&mut port).await?;
    Ok(format!("{host}:{}", u16::from_be_bytes(port)))
}

async fn reply(conn: &mut TcpStream, code: u8) -> io::Result<()> {
    // Bound address is not meaningful for this proxy; zeroes are allowed.
    conn.write_all(&[SOCKS_VERSION, code, 0, 0x01, 0, 0, 0, 0, 0, 0])
        .await
}

fn bad_data(message: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message.to_string())
}
