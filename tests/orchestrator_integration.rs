//! Integration tests for the resolution orchestrator.
//!
//! Adapters are in-process fakes counting their invocations; the durable
//! cache tier runs on a temporary SQLite file.

mod support;

use std::sync::Arc;
use std::time::Duration;

use debrid_core::cache::{DurableTier, MemoryTier};
use debrid_core::debrid::{ProviderKey, ResolutionRequest, ResolveOutcome};
use debrid_core::orchestrator::CatalogError;
use debrid_core::{
    CanonicalError, CredentialBlacklist, Database, Orchestrator, OrchestratorError,
    OrchestratorSettings, ProviderRegistry, StaticOutcome, TwoTierCache,
};
use futures_util::future::join_all;
use support::fake_provider::{ACCESS_BLOCKED, ACCESS_DENIED, BAD_TOKEN, Behavior, FakeProvider};
use tempfile::TempDir;

const HOST: &str = "https://resolver.test";
const LINK: &str = "https://cdn.provider.test/dl/Movie.mkv";

fn request(provider: ProviderKey, credential: &str) -> ResolutionRequest {
    ResolutionRequest {
        provider,
        credential: credential.to_string(),
        info_hash: "a".repeat(40),
        file_index: Some(0),
        file_name_hint: "Movie.mkv".to_string(),
        client_ip: Some("203.0.113.7".to_string()),
        host: HOST.to_string(),
        is_browser: false,
    }
}

fn orchestrator_with(
    fake: Arc<FakeProvider>,
    cache: TwoTierCache,
    settings: OrchestratorSettings,
) -> Orchestrator {
    let mut registry = ProviderRegistry::new();
    registry.register(fake);
    Orchestrator::new(registry, cache, CredentialBlacklist::new(), settings)
}

async fn enabled_cache() -> (TwoTierCache, TempDir) {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let db = Database::new(&temp_dir.path().join("cache.db"))
        .await
        .expect("Failed to create database");
    (
        TwoTierCache::new(MemoryTier::new(64), DurableTier::new(db)),
        temp_dir,
    )
}

// ==================== Dedup ====================

#[tokio::test]
async fn test_concurrent_identical_requests_invoke_provider_once() {
    let fake = Arc::new(
        FakeProvider::new(ProviderKey::RealDebrid, Behavior::Url(LINK.to_string()))
            .with_delay(Duration::from_millis(100)),
    );
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings::default(),
    );

    let calls = (0..10).map(|_| orchestrator.resolve(request(ProviderKey::RealDebrid, "tok")));
    let results = join_all(calls).await;

    assert_eq!(fake.resolves(), 1);
    assert_eq!(results.len(), 10);
    for result in results {
        let resolution = result.expect("resolution succeeds");
        assert_eq!(resolution.location, LINK);
    }
}

#[tokio::test]
async fn test_distinct_keys_are_not_collapsed() {
    let fake = Arc::new(
        FakeProvider::new(ProviderKey::TorBox, Behavior::Url(LINK.to_string()))
            .with_delay(Duration::from_millis(50)),
    );
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings::default(),
    );

    let first = orchestrator.resolve(request(ProviderKey::TorBox, "tok-1"));
    let second = orchestrator.resolve(request(ProviderKey::TorBox, "tok-2"));
    let (first, second) = tokio::join!(first, second);

    assert!(first.is_ok() && second.is_ok());
    assert_eq!(fake.resolves(), 2);
}

// ==================== Cache ====================

#[tokio::test]
async fn test_sequential_requests_hit_the_cache() {
    let (cache, _temp_dir) = enabled_cache().await;
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::Premiumize,
        Behavior::Url(LINK.to_string()),
    ));
    let orchestrator = orchestrator_with(Arc::clone(&fake), cache, OrchestratorSettings::default());

    for _ in 0..3 {
        let resolution = orchestrator
            .resolve(request(ProviderKey::Premiumize, "tok"))
            .await
            .expect("resolution succeeds");
        assert_eq!(resolution.outcome, ResolveOutcome::Url(LINK.to_string()));
    }
    assert_eq!(fake.resolves(), 1);
}

#[tokio::test]
async fn test_disabled_cache_recomputes_sequential_requests() {
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::Premiumize,
        Behavior::Url(LINK.to_string()),
    ));
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings::default(),
    );

    for _ in 0..2 {
        orchestrator
            .resolve(request(ProviderKey::Premiumize, "tok"))
            .await
            .expect("resolution succeeds");
    }
    assert_eq!(fake.resolves(), 2);
}

#[tokio::test]
async fn test_provider_errors_are_not_cached() {
    let (cache, _temp_dir) = enabled_cache().await;
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::AllDebrid,
        Behavior::Fail("hoster_unavailable"),
    ));
    let orchestrator = orchestrator_with(Arc::clone(&fake), cache, OrchestratorSettings::default());

    for _ in 0..2 {
        let resolution = orchestrator
            .resolve(request(ProviderKey::AllDebrid, "tok"))
            .await
            .expect("resolution answers");
        assert_eq!(
            resolution.outcome,
            ResolveOutcome::Static(StaticOutcome::FailedUnexpected)
        );
    }
    assert_eq!(fake.resolves(), 2);
}

// ==================== Timeout ====================

#[tokio::test]
async fn test_hanging_provider_times_out_to_failed_unexpected() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::Offcloud, Behavior::Hang));
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings {
            resolve_timeout: Duration::from_millis(100),
            ..OrchestratorSettings::default()
        },
    );

    let resolution = tokio::time::timeout(
        Duration::from_secs(5),
        orchestrator.resolve(request(ProviderKey::Offcloud, "tok")),
    )
    .await
    .expect("orchestrator answers before the outer deadline")
    .expect("resolution answers");

    assert_eq!(
        resolution.outcome,
        ResolveOutcome::Static(StaticOutcome::FailedUnexpected)
    );
    assert_eq!(
        resolution.location,
        StaticOutcome::FailedUnexpected.url(HOST)
    );
}

#[tokio::test]
async fn test_late_completion_populates_cache_after_timeout() {
    let (cache, _temp_dir) = enabled_cache().await;
    let fake = Arc::new(
        FakeProvider::new(ProviderKey::DebridLink, Behavior::Url(LINK.to_string()))
            .with_delay(Duration::from_millis(200)),
    );
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        cache,
        OrchestratorSettings {
            resolve_timeout: Duration::from_millis(50),
            ..OrchestratorSettings::default()
        },
    );

    let first = orchestrator
        .resolve(request(ProviderKey::DebridLink, "tok"))
        .await
        .expect("resolution answers");
    assert_eq!(
        first.outcome,
        ResolveOutcome::Static(StaticOutcome::FailedUnexpected)
    );

    tokio::time::sleep(Duration::from_millis(500)).await;

    let second = orchestrator
        .resolve(request(ProviderKey::DebridLink, "tok"))
        .await
        .expect("resolution answers");
    assert_eq!(second.location, LINK);
    assert_eq!(fake.resolves(), 1);
}

// ==================== Canonical errors ====================

#[tokio::test]
async fn test_bad_token_blacklists_credential() {
    let fake = Arc::new(FakeProvider::new(ProviderKey::RealDebrid, Behavior::Fail(BAD_TOKEN)));
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings::default(),
    );

    let first = orchestrator
        .resolve(request(ProviderKey::RealDebrid, "revoked"))
        .await
        .expect("resolution answers");
    assert_eq!(first.outcome, ResolveOutcome::Static(StaticOutcome::FailedAccess));
    assert!(orchestrator.blacklist().contains(ProviderKey::RealDebrid, "revoked"));

    let second = orchestrator
        .resolve(request(ProviderKey::RealDebrid, "revoked"))
        .await
        .expect("resolution answers");
    assert_eq!(second.outcome, ResolveOutcome::Static(StaticOutcome::FailedAccess));
    assert_eq!(fake.resolves(), 1, "blacklisted credential must not reach the provider");

    orchestrator
        .resolve(request(ProviderKey::RealDebrid, "other"))
        .await
        .expect("resolution answers");
    assert_eq!(fake.resolves(), 2);
}

#[tokio::test]
async fn test_access_errors_map_to_placeholders_without_blacklisting() {
    for (code, expected) in [
        (ACCESS_DENIED, StaticOutcome::FailedAccess),
        (ACCESS_BLOCKED, StaticOutcome::BlockedAccess),
        ("something_else", StaticOutcome::FailedUnexpected),
    ] {
        let fake = Arc::new(FakeProvider::new(ProviderKey::TorBox, Behavior::Fail(code)));
        let orchestrator = orchestrator_with(
            Arc::clone(&fake),
            TwoTierCache::disabled(),
            OrchestratorSettings::default(),
        );

        let resolution = orchestrator
            .resolve(request(ProviderKey::TorBox, "tok"))
            .await
            .expect("resolution answers");

        assert_eq!(resolution.outcome, ResolveOutcome::Static(expected), "code {code}");
        assert!(orchestrator.blacklist().is_empty());
    }
}

#[tokio::test]
async fn test_static_outcome_redirects_to_placeholder() {
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::Putio,
        Behavior::Static(StaticOutcome::Downloading),
    ));
    let orchestrator = orchestrator_with(fake, TwoTierCache::disabled(), OrchestratorSettings::default());

    let resolution = orchestrator
        .resolve(request(ProviderKey::Putio, "client@token"))
        .await
        .expect("resolution answers");

    assert_eq!(
        resolution.location,
        "https://resolver.test/videos/downloading_v2.mp4"
    );
}

// ==================== Validation ====================

#[tokio::test]
async fn test_invalid_requests_fail_fast() {
    let fake = Arc::new(FakeProvider::new(
        ProviderKey::EasyDebrid,
        Behavior::Url(LINK.to_string()),
    ));
    let orchestrator = orchestrator_with(
        Arc::clone(&fake),
        TwoTierCache::disabled(),
        OrchestratorSettings::default(),
    );

    let mut missing_hash = request(ProviderKey::EasyDebrid, "tok");
    missing_hash.info_hash = String::new();
    let error = orchestrator.resolve(missing_hash).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::Validation(_)));

    let mut short_hash = request(ProviderKey::EasyDebrid, "tok");
    short_hash.info_hash = "deadbeef".to_string();
    let error = orchestrator.resolve(short_hash).await.unwrap_err();
    assert!(matches!(error, OrchestratorError::Validation(_)));

    let error = orchestrator
        .resolve(request(ProviderKey::AllDebrid, "tok"))
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        OrchestratorError::UnknownProvider(ProviderKey::AllDebrid)
    ));
    assert_eq!(fake.resolves(), 0);
}

// ==================== Catalog ====================

#[tokio::test]
async fn test_catalog_listing_pages_and_blacklists_bad_tokens() {
    let healthy = Arc::new(FakeProvider::new(
        ProviderKey::Premiumize,
        Behavior::Url(LINK.to_string()),
    ));
    let orchestrator = orchestrator_with(healthy, TwoTierCache::disabled(), OrchestratorSettings::default());
    let first_page = orchestrator
        .list_cloud_items(ProviderKey::Premiumize, "tok", 0)
        .await
        .expect("listing succeeds");
    assert_eq!(first_page.len(), 1);
    let past_end = orchestrator
        .list_cloud_items(ProviderKey::Premiumize, "tok", 1)
        .await
        .expect("listing succeeds");
    assert!(past_end.is_empty());

    let revoked = Arc::new(FakeProvider::new(ProviderKey::Premiumize, Behavior::Fail(BAD_TOKEN)));
    let orchestrator = orchestrator_with(revoked, TwoTierCache::disabled(), OrchestratorSettings::default());
    let error = orchestrator
        .list_cloud_items(ProviderKey::Premiumize, "revoked", 0)
        .await
        .unwrap_err();
    assert!(matches!(
        error,
        CatalogError::Rejected(ProviderKey::Premiumize, CanonicalError::BadToken)
    ));
    assert!(orchestrator.blacklist().contains(ProviderKey::Premiumize, "revoked"));
}
