//! Public HTTP ingress.
//!
//! Every request's Host header is mapped to a subdomain label; the label
//! selects a tunnel route and the request is replayed through the owning
//! provider's tunnel. Hosts without a subdomain get a small informational
//! page.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::header::HOST;
use axum::http::{HeaderName, HeaderValue, StatusCode};
use axum::response::{Html, IntoResponse, Response};
use axum::Router;
use tracing::debug;

use peercompute_tunnel::{TunnelError, TunnelManager};

/// Largest request body accepted from the public side, matching the frame
/// limit on the peer protocol.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

const HOP_BY_HOP_HEADERS: &[&str] = &["connection", "keep-alive", "transfer-encoding", "upgrade"];

#[derive(Clone)]
pub struct GatewayState {
    pub manager: Arc<TunnelManager>,
}

pub fn router(state: GatewayState) -> Router {
    Router::new().fallback(proxy).with_state(state)
}

async fn proxy(State(state): State<GatewayState>, req: Request) -> Response {
    let host = req
        .headers()
        .get(HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("")
        .to_string();

    let Some(label) = extract_subdomain(&host, state.manager.base_domain()) else {
        return info_page(&state);
    };

    let method = req.method().to_string();
    let path = req
        .uri()
        .path_and_query()
        .map(|pq| pq.as_str().to_string())
        .unwrap_or_else(|| "/".to_string());

    let mut headers = HashMap::new();
    for (name, value) in req.headers() {
        if let Ok(value) = value.to_str() {
            headers.insert(name.to_string(), value.to_string());
        }
    }

    let body = match axum::body::to_bytes(req.into_body(), MAX_BODY_BYTES).await {
        Ok(bytes) => bytes.to_vec(),
        Err(_) => {
            return (StatusCode::PAYLOAD_TOO_LARGE, "request body too large").into_response()
        }
    };

    match state
        .manager
        .forward(&label, &method, &path, headers, body)
        .await
    {
        Ok(parts) => {
            let status =
                StatusCode::from_u16(parts.status_code).unwrap_or(StatusCode::BAD_GATEWAY);
            let mut response = Response::new(Body::from(parts.body));
            *response.status_mut() = status;
            for (key, value) in parts.headers {
                if HOP_BY_HOP_HEADERS.contains(&key.to_ascii_lowercase().as_str()) {
                    continue;
                }
                if let (Ok(name), Ok(value)) = (
                    HeaderName::try_from(key.as_str()),
                    HeaderValue::try_from(value.as_str()),
                ) {
                    response.headers_mut().insert(name, value);
                }
            }
            response
        }
        Err(TunnelError::NotFound(label)) => {
            debug!(label = %label, "No route for subdomain");
            (
                StatusCode::NOT_FOUND,
                format!("deployment '{label}' not found"),
            )
                .into_response()
        }
        Err(TunnelError::Timeout) => {
            (StatusCode::GATEWAY_TIMEOUT, "deployment did not respond").into_response()
        }
        Err(e) => {
            debug!(error = %e, "Tunnel forward failed");
            (StatusCode::BAD_GATEWAY, "deployment unreachable").into_response()
        }
    }
}

fn info_page(state: &GatewayState) -> Response {
    let base = state.manager.base_domain();
    let providers = state.manager.connected_providers().len();
    let routes = state.manager.route_count();
    Html(format!(
        "<!DOCTYPE html>\n<html>\n<head><title>Peer Compute Gateway</title></head>\n<body>\n\
         <h1>Peer Compute Gateway</h1>\n\
         <p>Deployed containers are reachable at <code>https://&lt;label&gt;.{base}</code>.</p>\n\
         <p>{providers} provider(s) connected, {routes} route(s) active.</p>\n\
         </body>\n</html>\n"
    ))
    .into_response()
}

/// Strip the base-domain suffix from a host header, yielding the subdomain
/// label. Bare hosts, `www`, and foreign domains yield nothing.
fn extract_subdomain(host: &str, base_domain: &str) -> Option<String> {
    let host = host.split(':').next().unwrap_or(host);
    let suffix = format!(".{base_domain}");
    let label = host.strip_suffix(&suffix)?;
    if label.is_empty() || label == "www" {
        return None;
    }
    Some(label.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower::ServiceExt;

    fn test_state() -> GatewayState {
        GatewayState {
            manager: TunnelManager::new("tunnel.test"),
        }
    }

    #[test]
    fn test_extract_subdomain() {
        assert_eq!(
            extract_subdomain("abc123def456.tunnel.test", "tunnel.test"),
            Some("abc123def456".to_string())
        );
        assert_eq!(
            extract_subdomain("abc123def456.tunnel.test:443", "tunnel.test"),
            Some("abc123def456".to_string())
        );
        assert_eq!(extract_subdomain("tunnel.test", "tunnel.test"), None);
        assert_eq!(extract_subdomain("www.tunnel.test", "tunnel.test"), None);
        assert_eq!(extract_subdomain("other.example.com", "tunnel.test"), None);
        assert_eq!(extract_subdomain("", "tunnel.test"), None);
    }

    #[tokio::test]
    async fn test_bare_host_serves_info_page() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/")
                    .header(HOST, "tunnel.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn test_unknown_label_is_404() {
        let app = router(test_state());
        let response = app
            .oneshot(
                Request::builder()
                    .uri("/anything")
                    .header(HOST, "feedcafe0000.tunnel.test")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
