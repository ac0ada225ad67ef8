use std::sync::Arc;

use tokio::net::TcpStream;
use tokio_socks::tcp::Socks5Stream;
use tracing::debug;

use crate::config::UpstreamConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::upstream::connect_tcp;

/// Dialer that reaches targets through an upstream SOCKS5 proxy
#[derive(Debug, Clone)]
pub struct Socks5Dialer {
    upstream: Arc<UpstreamConfig>,
}

impl Socks5Dialer {
    pub fn new(upstream: Arc<UpstreamConfig>) -> Self {
        Self { upstream }
    }

    /// Open a SOCKS5 stream to `target` (`host:port`).
    ///
    /// Authentication is negotiated on every call.
    pub async fn dial(&self, target: &str) -> ProxyResult<Socks5Stream<TcpStream>> {
        let socket = connect_tcp(&self.upstream).await?;

        let handshake = async {
            match &self.upstream.auth {
                Some(auth) => {
                    Socks5Stream::connect_with_password_and_socket(
                        socket,
                        target,
                        &auth.username,
                        &auth.password,
                    )
                    .await
                }
                None => Socks5Stream::connect_with_socket(socket, target).await,
            }
        };

        let stream = tokio::time::timeout(self.upstream.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ProxyError::UpstreamUnreachable(format!(
                    "SOCKS5 handshake with {} timed out",
                    self.upstream.addr()
                ))
            })?
            .map_err(|e| map_socks_error(target, e))?;

        debug!("SOCKS5 stream to {} established via {}", target, self.upstream.addr());
        Ok(stream)
    }
}

/// Socket-level failures mean the proxy could not be reached; anything the
/// proxy answered is a rejection.
fn map_socks_error(target: &str, err: tokio_socks::Error) -> ProxyError {
    match err {
        tokio_socks::Error::Io(e) => {
            ProxyError::UpstreamUnreachable(format!("SOCKS5 connection for {}: {}", target, e))
        }
        tokio_socks::Error::ProxyServerUnreachable => {
            ProxyError::UpstreamUnreachable(format!("SOCKS5 proxy unreachable for {}", target))
        }
        other => ProxyError::rejected(format!("SOCKS5 CONNECT {} failed: {}", target, other)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::Auth;
    use crate::config::UpstreamProtocol;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    /// Minimal SOCKS5 server: username/password auth, then answers the
    /// CONNECT with `reply`.
    async fn fake_socks5(mut stream: tokio::net::TcpStream, reply: u8) -> (String, String, String) {
        let mut header = [0u8; 2];
        stream.read_exact(&mut header).await.unwrap();
        let mut methods = vec![0u8; header[1] as usize];
        stream.read_exact(&mut methods).await.unwrap();
        assert!(methods.contains(&0x02));
        stream.write_all(&[0x05, 0x02]).await.unwrap();

        let mut ver = [0u8; 2];
        stream.read_exact(&mut ver).await.unwrap();
        let mut user = vec![0u8; ver[1] as usize];
        stream.read_exact(&mut user).await.unwrap();
        let mut plen = [0u8; 1];
        stream.read_exact(&mut plen).await.unwrap();
        let mut pass = vec![0u8; plen[0] as usize];
        stream.read_exact(&mut pass).await.unwrap();
        stream.write_all(&[0x01, 0x00]).await.unwrap();

        let mut request = [0u8; 4];
        stream.read_exact(&mut request).await.unwrap();
        assert_eq!(request[3], 0x03, "target should be sent as a domain name");
        let mut len = [0u8; 1];
        stream.read_exact(&mut len).await.unwrap();
        let mut domain = vec![0u8; len[0] as usize];
        stream.read_exact(&mut domain).await.unwrap();
        let mut port = [0u8; 2];
        stream.read_exact(&mut port).await.unwrap();

        stream
            .write_all(&[0x05, reply, 0x00, 0x01, 127, 0, 0, 1, 0x04, 0x38])
            .await
            .unwrap();

        if reply == 0x00 {
            let mut buf = [0u8; 4];
            stream.read_exact(&mut buf).await.unwrap();
            stream.write_all(&buf).await.unwrap();
        }

        (
            String::from_utf8(user).unwrap(),
            String::from_utf8(pass).unwrap(),
            format!("{}:{}", String::from_utf8(domain).unwrap(), u16::from_be_bytes(port)),
        )
    }

    fn dialer_for(port: u16) -> Socks5Dialer {
        let upstream = UpstreamConfig::new(UpstreamProtocol::Socks5, "127.0.0.1", port)
            .with_auth(Some(Auth::new("alice".to_string(), "secret1".to_string())));
        Socks5Dialer::new(Arc::new(upstream))
    }

    #[tokio::test]
    async fn dial_authenticates_and_relays() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            fake_socks5(stream, 0x00).await
        });

        let mut stream = dialer_for(port).dial("example.com:443").await.expect("socks stream");
        stream.write_all(b"ping").await.unwrap();
        let mut echoed = [0u8; 4];
        stream.read_exact(&mut echoed).await.unwrap();
        assert_eq!(&echoed, b"ping");

        let (user, pass, target) = server.await.unwrap();
        assert_eq!(user, "alice");
        assert_eq!(pass, "secret1");
        assert_eq!(target, "example.com:443");
    }

    #[tokio::test]
    async fn host_unreachable_reply_is_rejection() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            fake_socks5(stream, 0x04).await
        });

        let err = dialer_for(port).dial("unreachable.test:443").await.err().unwrap();
        assert!(matches!(err, ProxyError::UpstreamRejected { .. }));
    }

    #[tokio::test]
    async fn closed_port_is_unreachable() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = dialer_for(port).dial("example.com:443").await.err().unwrap();
        assert!(matches!(err, ProxyError::UpstreamUnreachable(_)));
    }
}
