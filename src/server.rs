use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response};
use hyper_util::rt::TokioIo;
use tokio::net::TcpListener;
use tracing::{debug, warn};

use crate::config::ProxyConfig;
use crate::connection::ActiveSessions;
use crate::error::ProxyResult;
use crate::response::ProxyBody;
use crate::upstream::UpstreamDialer;
use crate::{forward, tunnel};

const ACCEPT_BACKOFF_BASE_MS: u64 = 10;
const ACCEPT_BACKOFF_MAX_MS: u64 = 1000;

/// Everything a request handler needs, shared read-only across connections
#[derive(Debug)]
pub struct ProxyContext {
    pub dialer: UpstreamDialer,
    pub idle_timeout: Option<Duration>,
    pub sessions: ActiveSessions,
}

/// Local listener that accepts HTTP proxy clients
pub struct ProxyServer {
    listener: TcpListener,
    context: Arc<ProxyContext>,
}

impl ProxyServer {
    /// Bind the local port and prepare the dialer for the configured upstream
    pub async fn bind(config: ProxyConfig) -> ProxyResult<Self> {
        let dialer = UpstreamDialer::new(Arc::clone(&config.upstream))?;
        let listener = TcpListener::bind(config.listener.listen_addr).await?;

        Ok(Self {
            listener,
            context: Arc::new(ProxyContext {
                dialer,
                idle_timeout: config.idle_timeout,
                sessions: ActiveSessions::new(),
            }),
        })
    }

    pub fn local_addr(&self) -> ProxyResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    pub fn sessions(&self) -> ActiveSessions {
        self.context.sessions.clone()
    }

    /// Accept loop. Runs until the surrounding task is dropped; accept
    /// errors and failing connections never stop it.
    pub async fn run(self) {
        let mut accept_failures = 0u32;
        loop {
            match self.listener.accept().await {
                Ok((stream, peer_addr)) => {
                    accept_failures = 0;
                    debug!("New connection from {}", peer_addr);
                    let context = Arc::clone(&self.context);

                    tokio::task::spawn(async move {
                        let io = TokioIo::new(stream);
                        let service = service_fn(move |req| route(req, Arc::clone(&context)));

                        if let Err(err) = http1::Builder::new()
                            .preserve_header_case(true)
                            .title_case_headers(true)
                            .serve_connection(io, service)
                            .with_upgrades()
                            .await
                        {
                            // Only log connection errors, not normal endings
                            if !err.is_incomplete_message() {
                                warn!("Connection from {} error: {:?}", peer_addr, err);
                            }
                        }
                    });
                }
                Err(e) => {
                    accept_failures = accept_failures.saturating_add(1);
                    let delay = accept_backoff(accept_failures);
                    warn!("Accept error: {} (retrying in {:?})", e, delay);
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

/// Pause after the `failures`-th consecutive accept error, e.g. while the
/// process is out of file descriptors
fn accept_backoff(failures: u32) -> Duration {
    let millis = ACCEPT_BACKOFF_BASE_MS.saturating_mul(1 << failures.saturating_sub(1).min(10));
    Duration::from_millis(millis.min(ACCEPT_BACKOFF_MAX_MS))
}

/// CONNECT goes to the tunnel handler, every other method is forwarded
async fn route(
    req: Request<hyper::body::Incoming>,
    context: Arc<ProxyContext>,
) -> Result<Response<ProxyBody>, hyper::Error> {
    debug!("{} {}", req.method(), req.uri());

    if Method::CONNECT == req.method() {
        Ok(tunnel::handle(req, context).await)
    } else {
        Ok(forward::handle(req, &context.dialer).await)
    }
}
