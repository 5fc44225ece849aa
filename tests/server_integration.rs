//! Integration tests for the HTTP resolution endpoint.

mod support;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::body::{Body, to_bytes};
use axum::extract::ConnectInfo;
use axum::http::{Request, StatusCode, header};
use debrid_core::debrid::ProviderKey;
use debrid_core::server::{ResolverState, router};
use debrid_core::{
    CredentialBlacklist, Orchestrator, OrchestratorSettings, ProviderRegistry, StaticOutcome,
    TwoTierCache,
};
use support::fake_provider::{Behavior, FakeProvider};
use tempfile::TempDir;
use tower::ServiceExt;

const HOST: &str = "https://resolver.test";
const LINK: &str = "https://cdn.provider.test/dl/Movie.mkv";

fn state(fake: Arc<FakeProvider>) -> ResolverState {
    let mut registry = ProviderRegistry::new();
    registry.register(fake);
    ResolverState {
        orchestrator: Orchestrator::new(
            registry,
            TwoTierCache::disabled(),
            CredentialBlacklist::new(),
            OrchestratorSettings::default(),
        ),
        host: HOST.to_string(),
    }
}

fn get(uri: &str) -> Request<Body> {
    Request::builder()
        .uri(uri)
        .body(Body::empty())
        .expect("valid request")
}

fn location(response: &axum::response::Response) -> &str {
    response
        .headers()
        .get(header::LOCATION)
        .and_then(|value| value.to_str().ok())
        .expect("location header")
}

#[tokio::test]
async fn test_resolved_link_redirects_with_302() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::RealDebrid, Behavior::Url(LINK.to_string())));
    let app = router(state(Arc::clone(&fake)), None);
    let hash = "A".repeat(40);

    let response = app
        .oneshot(get(&format!("/realdebrid/tok/{hash}/Movie.mkv/2")))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), LINK);
    let seen = fake.last_request().expect("provider called");
    assert_eq!(seen.info_hash, "a".repeat(40));
    assert_eq!(seen.file_index, Some(2));
    assert_eq!(seen.file_name_hint, "Movie.mkv");
}

#[tokio::test]
async fn test_static_outcome_redirects_to_placeholder() {
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::TorBox,
        Behavior::Static(StaticOutcome::Downloading),
    ));
    let app = router(state(fake), None);

    let response = app
        .oneshot(get(&format!("/torbox/tok/{}/Movie.mkv/null", "b".repeat(40))))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(location(&response), StaticOutcome::Downloading.url(HOST));
}

#[tokio::test]
async fn test_null_index_and_trailing_filename_segment() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::AllDebrid, Behavior::Url(LINK.to_string())));
    let app = router(state(Arc::clone(&fake)), None);

    let response = app
        .oneshot(get(&format!(
            "/alldebrid/tok/{}/Movie.mkv/undefined/Movie.mkv",
            "c".repeat(40)
        )))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::FOUND);
    assert_eq!(fake.last_request().expect("provider called").file_index, None);
}

#[tokio::test]
async fn test_unknown_provider_is_404() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::RealDebrid, Behavior::Url(LINK.to_string())));
    let app = router(state(Arc::clone(&fake)), None);

    let response = app
        .oneshot(get(&format!("/notadebrid/tok/{}/Movie.mkv/0", "d".repeat(40))))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    assert_eq!(fake.resolves(), 0);
}

#[tokio::test]
async fn test_provider_without_adapter_is_404() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::RealDebrid, Behavior::Url(LINK.to_string())));
    let app = router(state(fake), None);

    let response = app
        .oneshot(get(&format!("/premiumize/tok/{}/Movie.mkv/0", "d".repeat(40))))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_client_ip_and_browser_flag_reach_the_provider() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::Premiumize, Behavior::Url(LINK.to_string())));
    let app = router(state(Arc::clone(&fake)), None);
    let socket: SocketAddr = "10.1.2.3:40000".parse().expect("socket address");

    let mut request = Request::builder()
        .uri(format!("/premiumize/tok/{}/Movie.mkv/0", "e".repeat(40)))
        .header(header::USER_AGENT, "Mozilla/5.0 (X11; Linux x86_64)")
        .body(Body::empty())
        .expect("valid request");
    request.extensions_mut().insert(ConnectInfo(socket));
    app.clone().oneshot(request).await.expect("router answers");

    let seen = fake.last_request().expect("provider called");
    assert_eq!(seen.client_ip.as_deref(), Some("10.1.2.3"));
    assert!(seen.is_browser);

    let request = Request::builder()
        .uri(format!("/premiumize/tok/{}/Movie.mkv/1", "e".repeat(40)))
        .header("x-forwarded-for", "198.51.100.4, 10.1.2.3")
        .header(header::USER_AGENT, "Stremio/4.4 Mozilla/5.0")
        .body(Body::empty())
        .expect("valid request");
    app.oneshot(request).await.expect("router answers");

    let seen = fake.last_request().expect("provider called");
    assert_eq!(seen.client_ip.as_deref(), Some("198.51.100.4"));
    assert!(!seen.is_browser);
}

#[tokio::test]
async fn test_placeholder_videos_are_served() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let file_name = StaticOutcome::FailedRar.file_name();
    std::fs::write(temp_dir.path().join(file_name), b"placeholder").expect("write placeholder");
    let fake = Arc::new(FakeProvider::new(ProviderKey::RealDebrid, Behavior::Url(LINK.to_string())));
    let app = router(state(fake), Some(temp_dir.path().to_path_buf()));

    let response = app
        .oneshot(get(&format!("/{}", StaticOutcome::FailedRar.path())))
        .await
        .expect("router answers");

    assert_eq!(response.status(), StatusCode::OK);
    let body = to_bytes(response.into_body(), 1024).await.expect("body");
    assert_eq!(&body[..], b"placeholder");
}
