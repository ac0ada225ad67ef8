use std::sync::Arc;

use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use tracing::{debug, error, info, warn};

use crate::error::ProxyError;
use crate::relay::relay;
use crate::response::{empty, text_response, upstream_error_response, ProxyBody};
use crate::server::ProxyContext;

/// Transfers above this size are logged at info level
const LARGE_TRANSFER_BYTES: u64 = 10 * 1024 * 1024;

/// Service a CONNECT request.
///
/// The upstream is dialed before anything is sent to the client, so a failed
/// dial is answered with 503 and the client socket is never taken over. On
/// success the 200 goes out first and the raw connection is claimed through
/// hyper's upgrade once that response is written.
pub async fn handle(req: Request<Incoming>, ctx: Arc<ProxyContext>) -> Response<ProxyBody> {
    let Some(target) = req.uri().authority().map(|auth| auth.to_string()) else {
        warn!("CONNECT host is not socket addr: {:?}", req.uri());
        return text_response(StatusCode::BAD_REQUEST, "CONNECT must be to a socket address");
    };

    let upstream = match ctx.dialer.dial(&target).await {
        Ok(stream) => stream,
        Err(e) => {
            match e.upstream_status() {
                Some(status) => warn!("Tunnel to {} refused by upstream with {}", target, status),
                None => warn!("Tunnel to {} failed: {}", target, e),
            }
            return upstream_error_response(&e);
        }
    };

    let mut guard = ctx.sessions.enter();
    let sessions = ctx.sessions.clone();
    let idle_timeout = ctx.idle_timeout;

    tokio::task::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                let label = format!("#{} {}", guard.id(), target);
                debug!("Tunnel {} open", label);

                let client = Box::new(TokioIo::new(upgraded));
                let stats = relay(client, upstream, label.clone(), idle_timeout).await;

                guard.release();
                if stats.from_client + stats.from_upstream > LARGE_TRANSFER_BYTES {
                    info!(
                        "Tunnel {} completed large transfer: {}↑ {}↓ bytes, {} active",
                        label,
                        stats.from_client,
                        stats.from_upstream,
                        sessions.active()
                    );
                } else {
                    debug!(
                        "Tunnel {} closed: {}↑ {}↓ bytes, {} active",
                        label,
                        stats.from_client,
                        stats.from_upstream,
                        sessions.active()
                    );
                }
            }
            Err(e) => {
                // Dropping `upstream` here closes the dialed connection
                let err = ProxyError::LocalTransportUnsupported(e.to_string());
                error!("Tunnel to {} aborted: {}", target, err);
            }
        }
    });

    Response::new(empty())
}
