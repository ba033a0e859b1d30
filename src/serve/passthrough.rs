//! Forwarding of non-intercepted requests to their original destination.

use super::ProxyState;
use anyhow::{Context, Result};
use axum::body::Body;
use axum::extract;
use axum::response::{IntoResponse, Response};
use http::header::{
    CONNECTION, CONTENT_LENGTH, CONTENT_SECURITY_POLICY, CONTENT_SECURITY_POLICY_REPORT_ONLY,
    HOST, PROXY_AUTHENTICATE, PROXY_AUTHORIZATION, TE, TRAILER, TRANSFER_ENCODING, UPGRADE,
};
use http::{HeaderMap, HeaderName, StatusCode};
use reqwest::redirect::Policy;
use std::sync::atomic::Ordering;

/// Upper bound on buffered request/response bodies.
const BODY_LIMIT: usize = 100 * 1024 * 1024;

const HOP_BY_HOP: [HeaderName; 7] = [
    CONNECTION,
    PROXY_AUTHENTICATE,
    PROXY_AUTHORIZATION,
    TE,
    TRAILER,
    TRANSFER_ENCODING,
    UPGRADE,
];

/// Create the shared client for forwarding to the original destination.
///
/// Redirects are passed back to the browser untouched, and the system
/// proxy is bypassed so the forwarded request cannot loop back into us.
pub(crate) fn client() -> Result<reqwest::Client> {
    reqwest::ClientBuilder::new()
        .http1_only()
        .redirect(Policy::none())
        .no_proxy()
        .build()
        .context("error building passthrough client")
}

pub(crate) async fn forward(state: &ProxyState, request: extract::Request) -> Response {
    match try_forward(state, request).await {
        Ok(response) => response,
        Err(err) => {
            // One report is enough; a flaky upstream would otherwise flood
            // the log with identical lines.
            if !state.passthrough_error_logged.swap(true, Ordering::Relaxed) {
                tracing::error!("failed to handle passthrough request: {err:#}");
                tracing::info!("further passthrough failures will be suppressed");
            }
            (StatusCode::BAD_GATEWAY, "Bad Gateway").into_response()
        }
    }
}

async fn try_forward(state: &ProxyState, request: extract::Request) -> Result<Response> {
    let (parts, body) = request.into_parts();

    let host = parts
        .headers
        .get(HOST)
        .and_then(|value| value.to_str().ok())
        .context("passthrough request carries no Host header")?
        .to_owned();
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    let target = format!("https://{host}{path_and_query}");

    let body = axum::body::to_bytes(body, BODY_LIMIT)
        .await
        .context("error buffering passthrough request body")?;

    let mut headers = parts.headers;
    headers.remove(HOST);
    scrub_hop_by_hop(&mut headers);

    let upstream = state
        .client
        .request(parts.method, &target)
        .headers(headers)
        .body(body)
        .send()
        .await
        .with_context(|| format!("error forwarding request to {target}"))?;

    let status = upstream.status();
    let mut headers = upstream.headers().clone();
    scrub_response_headers(state.hot, &mut headers);

    let bytes = upstream
        .bytes()
        .await
        .with_context(|| format!("error reading response from {target}"))?;

    let mut response = Response::new(Body::from(bytes));
    *response.status_mut() = status;
    *response.headers_mut() = headers;
    Ok(response)
}

fn scrub_hop_by_hop(headers: &mut HeaderMap) {
    for name in &HOP_BY_HOP {
        headers.remove(name);
    }
    headers.remove(HeaderName::from_static("keep-alive"));
}

/// Strip hop-by-hop headers, and in hot mode the CSP headers that would
/// keep the injected runtime from opening its loopback WebSocket.
fn scrub_response_headers(hot: bool, headers: &mut HeaderMap) {
    scrub_hop_by_hop(headers);
    // The buffered body is re-framed by the server.
    headers.remove(CONTENT_LENGTH);
    if hot {
        headers.remove(CONTENT_SECURITY_POLICY);
        headers.remove(CONTENT_SECURITY_POLICY_REPORT_ONLY);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::HeaderValue;

    fn upstream_headers() -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONTENT_SECURITY_POLICY,
            HeaderValue::from_static("connect-src 'self'"),
        );
        headers.insert(
            CONTENT_SECURITY_POLICY_REPORT_ONLY,
            HeaderValue::from_static("default-src 'self'"),
        );
        headers.insert("x-custom", HeaderValue::from_static("kept"));
        headers.insert(TRANSFER_ENCODING, HeaderValue::from_static("chunked"));
        headers
    }

    #[test]
    fn hot_mode_strips_csp() {
        let mut headers = upstream_headers();
        scrub_response_headers(true, &mut headers);

        assert!(!headers.contains_key(CONTENT_SECURITY_POLICY));
        assert!(!headers.contains_key(CONTENT_SECURITY_POLICY_REPORT_ONLY));
        assert_eq!(headers.get("x-custom").unwrap(), "kept");
    }

    #[test]
    fn csp_survives_outside_hot_mode() {
        let mut headers = upstream_headers();
        scrub_response_headers(false, &mut headers);

        assert!(headers.contains_key(CONTENT_SECURITY_POLICY));
        assert!(headers.contains_key(CONTENT_SECURITY_POLICY_REPORT_ONLY));
        // Hop-by-hop framing is still re-written.
        assert!(!headers.contains_key(TRANSFER_ENCODING));
    }
}
