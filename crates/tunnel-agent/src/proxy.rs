//! Reverse-proxy handler: forwards a matched request to its configured
//! upstream and streams the response back.
//!
//! Method, path, and query are forwarded as-is; only the first value of
//! each header is copied in either direction (an acknowledged
//! simplification — a multi-valued header loses everything past its first
//! value).

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use std::time::Duration;
use tracing::warn;

use crate::config::ExposedUpstream;

const UPSTREAM_TIMEOUT: Duration = Duration::from_secs(60);

/// Build the upstream request URL: `upstream.url` with `prefix` stripped
/// from the incoming path and the original query string reattached.
fn rewrite_url(upstream: &ExposedUpstream, path_and_query: &str) -> String {
    let without_prefix = path_and_query
        .strip_prefix('/')
        .unwrap_or(path_and_query)
        .strip_prefix(upstream.prefix.trim_start_matches('/'))
        .unwrap_or(path_and_query);
    let without_prefix = without_prefix.strip_prefix('/').unwrap_or(without_prefix);
    format!("{}/{}", upstream.url.trim_end_matches('/'), without_prefix)
}

/// A 500 response whose body is the failure string.
fn failure_response(message: &str) -> Response {
    (StatusCode::INTERNAL_SERVER_ERROR, message.to_string()).into_response()
}

fn copy_headers_single_valued(src: &HeaderMap) -> reqwest::header::HeaderMap {
    let mut out = reqwest::header::HeaderMap::new();
    for (name, value) in src.iter() {
        if out.contains_key(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            reqwest::header::HeaderName::from_bytes(name.as_str().as_bytes()),
            reqwest::header::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            out.insert(name, value);
        }
    }
    out
}

/// Axum handler registered for a matched [`ExposedUpstream`] prefix. Shares
/// a single [`reqwest::Client`] across requests via `State`.
pub async fn handle(
    State((client, upstream)): State<(reqwest::Client, ExposedUpstream)>,
    request: Request,
) -> Response {
    let method = request.method().clone();
    let path_and_query = request
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/")
        .to_string();
    let headers = copy_headers_single_valued(request.headers());
    let url = rewrite_url(&upstream, &path_and_query);

    let reqwest_method = match reqwest::Method::from_bytes(method.as_str().as_bytes()) {
        Ok(m) => m,
        Err(e) => return failure_response(&format!("unsupported method: {e}")),
    };

    let body_bytes = match axum::body::to_bytes(request.into_body(), usize::MAX).await {
        Ok(b) => b,
        Err(e) => {
            warn!(error = %e, "failed to buffer request body for proxying");
            return failure_response(&format!("failed to read request body: {e}"));
        }
    };

    let upstream_request = client
        .request(reqwest_method, &url)
        .headers(headers)
        .body(body_bytes)
        .timeout(UPSTREAM_TIMEOUT);

    let upstream_response = match upstream_request.send().await {
        Ok(resp) => resp,
        Err(e) => {
            warn!(error = %e, url = %url, "upstream request failed");
            return failure_response(&format!("upstream request failed: {e}"));
        }
    };

    let status = StatusCode::from_u16(upstream_response.status().as_u16())
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);

    let mut response_headers = HeaderMap::new();
    for (name, value) in upstream_response.headers().iter() {
        if response_headers.contains_key(name) {
            continue;
        }
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_str().as_bytes()),
            axum::http::HeaderValue::from_bytes(value.as_bytes()),
        ) {
            response_headers.insert(name, value);
        }
    }

    let body = Body::from_stream(upstream_response.bytes_stream());
    let mut response = Response::builder().status(status).body(body).unwrap();
    *response.headers_mut() = response_headers;
    response
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rewrite_url_strips_prefix_and_joins_upstream_base() {
        let upstream = ExposedUpstream {
            prefix: "api".to_string(),
            url: "http://127.0.0.1:9000".to_string(),
        };
        assert_eq!(
            rewrite_url(&upstream, "/api/v1/widgets?color=red"),
            "http://127.0.0.1:9000/v1/widgets?color=red"
        );
    }

    #[test]
    fn rewrite_url_handles_bare_prefix() {
        let upstream = ExposedUpstream {
            prefix: "api".to_string(),
            url: "http://127.0.0.1:9000".to_string(),
        };
        assert_eq!(rewrite_url(&upstream, "/api"), "http://127.0.0.1:9000/");
    }

    #[tokio::test]
    async fn failure_response_carries_the_failure_string_in_the_body() {
        let response = failure_response("upstream request failed: connection refused");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(
            String::from_utf8(body.to_vec()).unwrap(),
            "upstream request failed: connection refused"
        );
    }
}
