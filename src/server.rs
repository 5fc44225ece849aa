//! Inbound HTTP resolution endpoint.
//!
//! `GET /{provider}/{credential}/{infoHash}/{fileName}/{fileIndex}[/{filename}]`
//! answers 302 to the resolved link or to a placeholder video, and 404 when
//! the request cannot be served. Placeholder videos are served from
//! `/videos/` when a directory is configured.

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Path, State};
use axum::http::{HeaderMap, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tower_http::services::ServeDir;
use tower_http::trace::TraceLayer;
use tracing::{Span, debug, info, warn};

use crate::debrid::{ProviderKey, ResolutionRequest};
use crate::orchestrator::Orchestrator;
use crate::outcome::PLACEHOLDER_PATH_PREFIX;

/// Shared state of the resolution endpoint.
#[derive(Debug, Clone)]
pub struct ResolverState {
    /// Resolution orchestrator.
    pub orchestrator: Orchestrator,
    /// Public host placeholder URLs are built under.
    pub host: String,
}

#[derive(Debug, Deserialize)]
struct ResolvePath {
    provider: String,
    credential: String,
    info_hash: String,
    file_name: String,
    file_index: String,
}

/// Builds the router. `videos_dir` mounts the placeholder directory under `/videos`.
pub fn router(state: ResolverState, videos_dir: Option<PathBuf>) -> Router {
    let trace_layer = TraceLayer::new_for_http()
        .make_span_with(|request: &Request<_>| {
            tracing::info_span!(
                "http.request",
                method = %request.method(),
                provider = request.uri().path().split('/').nth(1).unwrap_or_default(),
                status_code = tracing::field::Empty,
                latency_ms = tracing::field::Empty
            )
        })
        .on_response(|response: &Response, latency: Duration, span: &Span| {
            span.record("status_code", response.status().as_u16());
            span.record("latency_ms", u64::try_from(latency.as_millis()).unwrap_or(u64::MAX));
        });

    let mut router = Router::new()
        .route(
            "/{provider}/{credential}/{info_hash}/{file_name}/{file_index}",
            get(resolve_handler),
        )
        .route(
            "/{provider}/{credential}/{info_hash}/{file_name}/{file_index}/{filename}",
            get(resolve_handler),
        );
    if let Some(dir) = videos_dir {
        router = router.nest_service(&format!("/{PLACEHOLDER_PATH_PREFIX}"), ServeDir::new(dir));
    }
    router.layer(trace_layer).with_state(Arc::new(state))
}

/// Serves `router` on `addr` until the process stops.
///
/// # Errors
///
/// Returns an error if the listener cannot bind or the server fails.
pub async fn serve(router: Router, addr: SocketAddr) -> Result<()> {
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Cannot bind resolver to {addr}\n  Suggestion: Choose a free port with --port"))?;
    info!(address = %addr, "resolver listening");
    axum::serve(
        listener,
        router.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("resolver server terminated unexpectedly")
}

async fn resolve_handler(
    State(state): State<Arc<ResolverState>>,
    Path(path): Path<ResolvePath>,
    headers: HeaderMap,
    extensions: axum::http::Extensions,
) -> Response {
    let Ok(provider) = path.provider.parse::<ProviderKey>() else {
        debug!(provider = %path.provider, "unknown provider");
        return StatusCode::NOT_FOUND.into_response();
    };
    let socket = extensions
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let request = ResolutionRequest {
        provider,
        credential: path.credential,
        info_hash: path.info_hash.to_lowercase(),
        file_index: parse_file_index(&path.file_index),
        file_name_hint: path.file_name,
        client_ip: client_ip(&headers, socket),
        host: state.host.clone(),
        is_browser: is_browser(&headers),
    };

    match state.orchestrator.resolve(request).await {
        Ok(resolution) => redirect(&resolution.location),
        Err(error) => {
            warn!(error = %error, "resolution request rejected");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

fn redirect(location: &str) -> Response {
    match HeaderValue::from_str(location) {
        Ok(value) => (StatusCode::FOUND, [(header::LOCATION, value)]).into_response(),
        Err(_) => {
            warn!("resolved location is not a valid header value");
            StatusCode::NOT_FOUND.into_response()
        }
    }
}

/// `fileIndex` segment as an index; `null`, `undefined` and junk mean none.
fn parse_file_index(segment: &str) -> Option<u32> {
    segment.parse().ok()
}

/// First `X-Forwarded-For` hop, else the socket address.
fn client_ip(headers: &HeaderMap, socket: Option<SocketAddr>) -> Option<String> {
    headers
        .get("x-forwarded-for")
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.split(',').next())
        .map(str::trim)
        .filter(|ip| !ip.is_empty())
        .map(ToString::to_string)
        .or_else(|| socket.map(|addr| addr.ip().to_string()))
}

fn is_browser(headers: &HeaderMap) -> bool {
    headers
        .get(header::USER_AGENT)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|agent| agent.contains("Mozilla") && !agent.contains("Stremio"))
}
