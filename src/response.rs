use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use hyper::{Response, StatusCode};

use crate::error::ProxyError;

/// Body type of every response the local listener writes
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

pub fn empty() -> ProxyBody {
    Empty::<Bytes>::new()
        .map_err(|never| match never {})
        .boxed()
}

pub fn full<T: Into<Bytes>>(chunk: T) -> ProxyBody {
    Full::new(chunk.into())
        .map_err(|never| match never {})
        .boxed()
}

pub fn text_response<T: Into<Bytes>>(status: StatusCode, msg: T) -> Response<ProxyBody> {
    let mut resp = Response::new(full(msg));
    *resp.status_mut() = status;
    resp.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    resp
}

/// 503 carrying the upstream error text
pub fn upstream_error_response(err: &ProxyError) -> Response<ProxyBody> {
    text_response(StatusCode::SERVICE_UNAVAILABLE, err.to_string())
}

/// Append every header of `src` to `dst`. Repeated names keep all values.
pub fn copy_headers(dst: &mut HeaderMap, src: &HeaderMap) {
    for (name, value) in src.iter() {
        dst.append(name.clone(), value.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hyper::header::SET_COOKIE;

    #[test]
    fn copy_headers_keeps_duplicates() {
        let mut src = HeaderMap::new();
        src.append(SET_COOKIE, HeaderValue::from_static("a=1"));
        src.append(SET_COOKIE, HeaderValue::from_static("b=2"));
        src.insert("x-test", HeaderValue::from_static("1"));

        let mut dst = HeaderMap::new();
        copy_headers(&mut dst, &src);

        let cookies: Vec<_> = dst.get_all(SET_COOKIE).iter().collect();
        assert_eq!(cookies, vec!["a=1", "b=2"]);
        assert_eq!(dst["x-test"], "1");
    }

    #[test]
    fn copy_headers_appends_to_existing() {
        let mut dst = HeaderMap::new();
        dst.insert("via", HeaderValue::from_static("local"));

        let mut src = HeaderMap::new();
        src.insert("via", HeaderValue::from_static("upstream"));

        copy_headers(&mut dst, &src);
        assert_eq!(dst.get_all("via").iter().count(), 2);
    }

    #[tokio::test]
    async fn upstream_error_is_503_with_text() {
        let err = ProxyError::UpstreamUnreachable("127.0.0.1:9: connection refused".into());
        let resp = upstream_error_response(&err);
        assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = resp.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(body, "upstream unreachable: 127.0.0.1:9: connection refused");
    }
}
