//! Minimal HTTP proxy: CONNECT for https, absolute-form requests for http.

use super::ProxyCredential;
use adslproxy_core::splice;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

const MAX_HEAD: usize = 16 * 1024;

/// Bind the proxy on an ephemeral localhost port and serve in the
/// background. Returns the bound address.
pub async fn spawn(credential: Option<ProxyCredential>) -> io::Result<SocketAddr> {
    let listener = TcpListener::bind("127.0.0.1:0").await?;
    let addr = listener.local_addr()?;
    let credential = credential.map(Arc::new);
    info!(addr = %addr, "http proxy listening");

    tokio::spawn(async move {
        loop {
            match listener.accept().await {
                Ok((conn, _)) => {
                    let credential = credential.clone();
                    tokio::spawn(async move {
                        if let Err(e) = handle(conn, credential).await {
                            debug!(error = %e, "http proxy connection ended");
                        }
                    });
                }
                Err(e) => {
                    warn!(error = %e, "http proxy accept failed");
                    break;
                }
            }
        }
    });

    Ok(addr)
}

async fn handle(mut conn: TcpStream, credential: Option<Arc<ProxyCredential>>) -> io::Result<()> {
    let (head, leftover) = read_head(&mut conn).await?;
    let head_text = String::from_utf8_lossy(&head).into_owned();

    let request_line = head_text.lines().next().unwrap_or_default().to_string();
    let mut parts = request_line.split_whitespace();
    let (Some(method), Some(target), Some(version)) = (parts.next(), parts.next(), parts.next())
    else {
        respond(&mut conn, "400 Bad Request").await?;
        return Ok(());
    };

    if let Some(credential) = &credential {
        if !authorized(&head_text, credential) {
            conn.write_all(
                b"HTTP/1.1 407 Proxy Authentication Required\r\n\
                  Proxy-Authenticate: Basic realm=\"adslproxy\"\r\n\
                  Connection: close\r\n\r\n",
            )
            .await?;
            return Ok(());
        }
    }

    if method.eq_ignore_ascii_case("CONNECT") {
        let Ok(mut upstream) = TcpStream::connect(target).await else {
            respond(&mut conn, "502 Bad Gateway").await?;
            return Ok(());
        };
        conn.write_all(b"HTTP/1.1 200 Connection Established\r\n\r\n")
            .await?;
        // Bytes the client pipelined behind its request head.
        upstream.write_all(&leftover).await?;
        splice(conn, upstream).await?;
        return Ok(());
    }

    // Absolute-form request: dial the origin, rewrite to origin-form.
    let Some((host_port, path)) = parse_absolute_uri(target) else {
        respond(&mut conn, "400 Bad Request").await?;
        return Ok(());
    };
    let Ok(mut upstream) = TcpStream::connect(&host_port).await else {
        respond(&mut conn, "502 Bad Gateway").await?;
        return Ok(());
    };

    let mut rewritten = format!("{method} {path} {version}\r\n");
    for line in head_text.lines().skip(1) {
        if line.is_empty() {
            break;
        }
        let lower = line.to_ascii_lowercase();
        if lower.starts_with("proxy-authorization:") || lower.starts_with("proxy-connection:") {
            continue;
        }
        rewritten.push_str(line);
        rewritten.push_str("\r\n");
    }
    rewritten.push_str("\r\n");

    upstream.write_all(rewritten.as_bytes()).await?;
    upstream.write_all(&leftover).await?;
    splice(conn, upstream).await?;
    Ok(())
}

async fn respond(conn: &mut TcpStream, status: &str) -> io::Result<()> {
    let reply = format!("HTTP/1.1 {status}\r\nConnection: close\r\n\r\n");
    conn.write_all(reply.as_bytes()).await
}

/// Read until the end of the header block. Returns the head (including the
/// terminator) and any body bytes read past it.
async fn read_head(conn: &mut TcpStream) -> io::Result<(Vec<u8>, Vec<u8>)> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        let n = conn.read(&mut chunk).await?;
        if n == 0 {
            return Err(io::ErrorKind::UnexpectedEof.into());
        }
        buf.extend_from_slice(&chunk[..n]);

        if let Some(pos) = find_head_end(&buf) {
            let leftover = buf.split_off(pos);
            return Ok((buf, leftover));
        }
        if buf.len() > MAX_HEAD {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "request head too large",
            ));
        }
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|pos| pos + 4)
}

fn authorized(head: &str, credential: &ProxyCredential) -> bool {
    let expected = BASE64.encode(format!(
        "{}:{}",
        credential.username, credential.password
    ));

    head.lines().any(|line| {
        let Some((name, value)) = line.split_once(':') else {
            return false;
        };
        name.eq_ignore_ascii_case("proxy-authorization")
            && value.trim() == format!("Basic {expected}")
    })
}

/// `http://host[:port]/path` to (`host:port`, `/path`).
fn parse_absolute_uri(target: &str) -> Option<(String, String)> {
    let rest = target.strip_prefix("http://")?;
    let (host_port, path) = match rest.find('/') {
        Some(pos) => (&rest[..pos], rest[pos..].to_string()),
        None => (rest, "/".to_string()),
    };
    if host_port.is_empty() {
        return None;
    }

    let host_port = if host_port.contains(':') {
        host_port.to_string()
    } else {
        format!("{host_port}:80")
    };
    Some((host_port, path))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn absolute_uri_with_port_and_path() {
        let (host, path) = parse_absolute_uri("http://example.com:8080/a/b?q=1").unwrap();
        assert_eq!(host, "example.com:8080");
        assert_eq!(path, "/a/b?q=1");
    }

    #[test]
    fn absolute_uri_defaults() {
        let (host, path) = parse_absolute_uri("http://example.com").unwrap();
        assert_eq!(host, "example.com:80");
        assert_eq!(path, "/");
        assert!(parse_absolute_uri("ftp://example.com").is_none());
    }

    #[test]
    fn authorization_header_is_checked() {
        let credential = ProxyCredential {
            username: "u".into(),
            password: "p".into(),
        };
        let ok = "GET / HTTP/1.1\r\nProxy-Authorization: Basic dTpw\r\n\r\n";
        let bad = "GET / HTTP/1.1\r\nProxy-Authorization: Basic eDp5\r\n\r\n";
        assert!(authorized(ok, &credential));
        assert!(!authorized(bad, &credential));
        assert!(!authorized("GET / HTTP/1.1\r\n\r\n", &credential));
    }

    #[tokio::test]
    async fn connect_tunnels_to_backend() {
        // Echo backend.
        let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let backend_addr = backend.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut conn, _) = backend.accept().await.unwrap();
            let (mut r, mut w) = conn.split();
            let _ = tokio::io::copy(&mut r, &mut w).await;
        });

        let proxy_addr = spawn(None).await.unwrap();
        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        let connect = format!("CONNECT {backend_addr} HTTP/1.1\r\n\r\n");
        client.write_all(connect.as_bytes()).await.unwrap();

        let mut reply = [0u8; 39];
        client.read_exact(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 200"));

        client.write_all(b"hello").await.unwrap();
        let mut echoed = [0u8; 5];
        client.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"hello");
    }

    #[tokio::test]
    async fn missing_credential_gets_407() {
        let credential = ProxyCredential {
            username: "u".into(),
            password: "p".into(),
        };
        let proxy_addr = spawn(Some(credential)).await.unwrap();

        let mut client = TcpStream::connect(proxy_addr).await.unwrap();
        client
            .write_all(b"CONNECT 127.0.0.1:1 HTTP/1.1\r\n\r\n")
            .await
            .unwrap();

        let mut reply = Vec::new();
        client.read_to_end(&mut reply).await.unwrap();
        assert!(reply.starts_with(b"HTTP/1.1 407"));
    }
}
