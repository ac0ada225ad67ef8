use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::config::{UpstreamConfig, UpstreamProtocol};
use crate::error::{ProxyError, ProxyResult};
use crate::http_connect::HttpConnectDialer;
use crate::socks::Socks5Dialer;

/// Byte stream that can be relayed
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Connection handed out by a dialer. Exactly one owner at a time.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Dialer for the configured upstream
#[derive(Debug)]
pub enum UpstreamDialer {
    HttpConnect(HttpConnectDialer),
    Socks5(Socks5Dialer),
}

impl UpstreamDialer {
    pub fn new(upstream: Arc<UpstreamConfig>) -> ProxyResult<Self> {
        match upstream.protocol {
            UpstreamProtocol::HttpConnect => Ok(Self::HttpConnect(HttpConnectDialer::new(upstream)?)),
            UpstreamProtocol::Socks5 => Ok(Self::Socks5(Socks5Dialer::new(upstream))),
        }
    }

    /// Open a tunnel to `target` (`host:port`) through the upstream
    pub async fn dial(&self, target: &str) -> ProxyResult<BoxedStream> {
        match self {
            Self::HttpConnect(dialer) => dialer.dial(target).await,
            Self::Socks5(dialer) => dialer.dial(target).await.map(|s| Box::new(s) as BoxedStream),
        }
    }
}

/// Plain TCP connection to the upstream proxy, bounded by the connect timeout
pub async fn connect_tcp(upstream: &UpstreamConfig) -> ProxyResult<TcpStream> {
    let addr = upstream.addr();
    let stream = tokio::time::timeout(upstream.connect_timeout, TcpStream::connect(addr.as_str()))
        .await
        .map_err(|_| {
            ProxyError::UpstreamUnreachable(format!(
                "connecting to {} timed out after {:?}",
                addr, upstream.connect_timeout
            ))
        })?
        .map_err(|e| ProxyError::UpstreamUnreachable(format!("{}: {}", addr, e)))?;

    let _ = stream.set_nodelay(true);
    debug!("Connected to upstream {}", addr);
    Ok(stream)
}

/// TLS client setup backed by the platform's trust store
pub fn native_tls_connector() -> ProxyResult<TlsConnector> {
    let mut root_store = rustls::RootCertStore::empty();

    let native_certs = rustls_native_certs::load_native_certs()
        .map_err(|e| ProxyError::ConfigInvalid(format!("cannot load native certificates: {}", e)))?;
    for cert in native_certs {
        // Platform stores routinely carry a few certificates rustls refuses
        let _ = root_store.add(&rustls::Certificate(cert.0));
    }
    if root_store.is_empty() {
        return Err(ProxyError::ConfigInvalid(
            "no usable root certificates found for upstream TLS".to_string(),
        ));
    }

    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}
