use hyper::body::Incoming;
use hyper::client::conn::http1::Builder;
use hyper::header::{HeaderName, HeaderValue, HOST, PROXY_AUTHORIZATION};
use hyper::{Request, Response, StatusCode, Uri};
use hyper_util::rt::TokioIo;
use http_body_util::BodyExt;
use tracing::{debug, warn};

use crate::auth::Auth;
use crate::error::{ProxyError, ProxyResult};
use crate::http_connect::HttpConnectDialer;
use crate::response::{copy_headers, text_response, upstream_error_response, ProxyBody};
use crate::socks::Socks5Dialer;
use crate::upstream::{BoxedStream, UpstreamDialer};

const PROXY_CONNECTION: HeaderName = HeaderName::from_static("proxy-connection");

/// Forward a non-CONNECT request through the upstream and stream the answer
/// back with its status and headers intact.
pub async fn handle(req: Request<Incoming>, dialer: &UpstreamDialer) -> Response<ProxyBody> {
    let Some(host) = req.uri().host().map(str::to_string) else {
        warn!("HTTP request missing host: {:?}", req.uri());
        return text_response(StatusCode::BAD_REQUEST, "HTTP request missing host");
    };
    let port = req.uri().port_u16().unwrap_or(80);
    let uri = req.uri().clone();

    let result = match dialer {
        UpstreamDialer::HttpConnect(d) => via_http_proxy(req, d).await,
        UpstreamDialer::Socks5(d) => via_socks5(req, d, &format!("{}:{}", host, port)).await,
    };

    match result {
        Ok(upstream) => {
            debug!("{} answered {}", uri, upstream.status());
            relay_response(upstream)
        }
        Err(e) => {
            warn!("Forwarding {} failed: {}", uri, e);
            upstream_error_response(&e)
        }
    }
}

/// The HTTP proxy gets the absolute-form request plus our credentials
async fn via_http_proxy(
    mut req: Request<Incoming>,
    dialer: &HttpConnectDialer,
) -> ProxyResult<Response<Incoming>> {
    let stream = dialer.connect_proxy().await?;

    let headers = req.headers_mut();
    headers.remove(PROXY_AUTHORIZATION);
    if let Some(value) = dialer.upstream().auth.as_ref().and_then(Auth::proxy_authorization) {
        headers.insert(PROXY_AUTHORIZATION, value);
    }

    send(stream, req).await
}

/// Through SOCKS5 we talk to the origin directly, so the request goes out in
/// origin-form without proxy headers
async fn via_socks5(
    mut req: Request<Incoming>,
    dialer: &Socks5Dialer,
    target: &str,
) -> ProxyResult<Response<Incoming>> {
    let stream = dialer.dial(target).await?;

    let authority = req.uri().authority().map(|a| a.as_str().to_string());
    *req.uri_mut() = origin_form(req.uri())?;

    let headers = req.headers_mut();
    headers.remove(PROXY_AUTHORIZATION);
    headers.remove(PROXY_CONNECTION);
    if !headers.contains_key(HOST) {
        if let Some(value) = authority.and_then(|a| HeaderValue::from_str(&a).ok()) {
            headers.insert(HOST, value);
        }
    }

    send(Box::new(stream), req).await
}

async fn send(stream: BoxedStream, req: Request<Incoming>) -> ProxyResult<Response<Incoming>> {
    let (mut sender, conn) = Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .handshake(TokioIo::new(stream))
        .await
        .map_err(|e| ProxyError::rejected(format!("upstream handshake failed: {}", e)))?;

    // Keep driving the connection until the response body is fully streamed
    tokio::spawn(async move {
        if let Err(err) = conn.await {
            debug!("Upstream HTTP connection error: {}", err);
        }
    });

    sender
        .send_request(req)
        .await
        .map_err(|e| ProxyError::rejected(format!("upstream request failed: {}", e)))
}

fn relay_response(upstream: Response<Incoming>) -> Response<ProxyBody> {
    let (parts, body) = upstream.into_parts();
    let mut resp = Response::new(body.boxed());
    *resp.status_mut() = parts.status;
    copy_headers(resp.headers_mut(), &parts.headers);
    resp
}

fn origin_form(uri: &Uri) -> ProxyResult<Uri> {
    let path = uri.path_and_query().map(|pq| pq.as_str()).unwrap_or("/");
    path.parse::<Uri>()
        .map_err(|e| ProxyError::rejected(format!("cannot rewrite {}: {}", uri, e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_form_keeps_path_and_query() {
        let uri: Uri = "http://example.com:8080/a/b?c=1".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/a/b?c=1");
    }

    #[test]
    fn origin_form_defaults_to_root() {
        let uri: Uri = "http://example.com".parse().unwrap();
        assert_eq!(origin_form(&uri).unwrap(), "/");
    }
}
