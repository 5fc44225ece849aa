//! Shared User-Agent string for outbound provider traffic.

const PROJECT_UA_URL: &str = "https://github.com/fierce/debrid-resolver";

/// Default User-Agent for provider API requests (one format for every provider).
#[must_use]
pub(crate) fn default_provider_user_agent() -> String {
    let version = env!("CARGO_PKG_VERSION");
    format!("debrid-resolver/{version} (+{PROJECT_UA_URL})")
}
