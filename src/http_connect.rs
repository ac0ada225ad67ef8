use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::client::conn::http1::Builder;
use hyper::header::{HOST, PROXY_AUTHORIZATION};
use hyper::{Method, Request, StatusCode};
use hyper_util::rt::TokioIo;
use tokio_rustls::TlsConnector;
use tracing::debug;

use crate::auth::Auth;
use crate::config::UpstreamConfig;
use crate::error::{ProxyError, ProxyResult};
use crate::upstream::{connect_tcp, native_tls_connector, BoxedStream};

/// Dialer that reaches targets through an upstream HTTP proxy using CONNECT
#[derive(Clone)]
pub struct HttpConnectDialer {
    upstream: Arc<UpstreamConfig>,
    tls: Option<TlsConnector>,
}

impl std::fmt::Debug for HttpConnectDialer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpConnectDialer")
            .field("upstream", &self.upstream)
            .field("tls", &self.tls.is_some())
            .finish()
    }
}

impl HttpConnectDialer {
    pub fn new(upstream: Arc<UpstreamConfig>) -> ProxyResult<Self> {
        if upstream.tls {
            let connector = native_tls_connector()?;
            return Ok(Self::with_tls(upstream, connector));
        }
        Ok(Self { upstream, tls: None })
    }

    /// Same as `new` for a TLS upstream, trusting whatever `connector` trusts
    pub fn with_tls(upstream: Arc<UpstreamConfig>, connector: TlsConnector) -> Self {
        Self {
            upstream,
            tls: Some(connector),
        }
    }

    pub fn upstream(&self) -> &UpstreamConfig {
        &self.upstream
    }

    /// Open a connection to the proxy itself, wrapped in TLS when configured
    pub async fn connect_proxy(&self) -> ProxyResult<BoxedStream> {
        let tcp = connect_tcp(&self.upstream).await?;

        let Some(connector) = &self.tls else {
            return Ok(Box::new(tcp));
        };

        let server_name = rustls::ServerName::try_from(self.upstream.host.as_str()).map_err(|e| {
            ProxyError::ConfigInvalid(format!("bad TLS name {}: {}", self.upstream.host, e))
        })?;
        let stream = tokio::time::timeout(
            self.upstream.connect_timeout,
            connector.connect(server_name, tcp),
        )
        .await
        .map_err(|_| {
            ProxyError::UpstreamUnreachable(format!("TLS handshake with {} timed out", self.upstream.addr()))
        })?
        .map_err(|e| {
            ProxyError::UpstreamUnreachable(format!("TLS handshake with {}: {}", self.upstream.addr(), e))
        })?;

        Ok(Box::new(stream))
    }

    /// Establish a tunnel to `target` and hand back the raw stream.
    ///
    /// Every call opens a fresh proxy connection; nothing is pooled. A non-200
    /// answer drops the response and the connection before returning.
    pub async fn dial(&self, target: &str) -> ProxyResult<BoxedStream> {
        let stream = self.connect_proxy().await?;
        let request = connect_request(target, self.upstream.auth.as_ref())?;

        let handshake = async {
            let (mut sender, conn) = Builder::new()
                .title_case_headers(true)
                .handshake(TokioIo::new(stream))
                .await?;

            let target_owned = target.to_string();
            tokio::spawn(async move {
                if let Err(err) = conn.with_upgrades().await {
                    debug!("CONNECT {} upstream connection ended: {}", target_owned, err);
                }
            });

            sender.send_request(request).await
        };

        let response = tokio::time::timeout(self.upstream.connect_timeout, handshake)
            .await
            .map_err(|_| {
                ProxyError::UpstreamUnreachable(format!(
                    "CONNECT {} via {} timed out",
                    target,
                    self.upstream.addr()
                ))
            })?
            .map_err(|e| ProxyError::rejected(format!("CONNECT {} failed: {}", target, e)))?;

        let status = response.status();
        if status != StatusCode::OK {
            drop(response);
            return Err(ProxyError::UpstreamRejected {
                status: Some(status),
                reason: format!("CONNECT {} answered {}", target, status),
            });
        }

        let upgraded = hyper::upgrade::on(response)
            .await
            .map_err(|e| ProxyError::rejected(format!("CONNECT {} not upgraded: {}", target, e)))?;

        debug!("Tunnel to {} established via {}", target, self.upstream.addr());
        Ok(Box::new(TokioIo::new(upgraded)))
    }
}

/// `CONNECT target HTTP/1.1` with Basic proxy credentials when present
pub fn connect_request(target: &str, auth: Option<&Auth>) -> ProxyResult<Request<Empty<Bytes>>> {
    let mut builder = Request::builder()
        .method(Method::CONNECT)
        .uri(target)
        .header(HOST, target);

    if let Some(value) = auth.and_then(Auth::proxy_authorization) {
        builder = builder.header(PROXY_AUTHORIZATION, value);
    }

    builder
        .body(Empty::new())
        .map_err(|e| ProxyError::rejected(format!("invalid CONNECT target {}: {}", target, e)))
}
