//! Error types for debrid provider operations.
//!
//! Two layers live here:
//! - [`ProviderError`] is the raw failure an adapter raises (network error,
//!   HTTP status, provider API error code, malformed response).
//! - [`CanonicalError`] is the closed set of conditions the orchestrator
//!   handles specially. Each adapter translates raw errors into it through
//!   `DebridProvider::classify_error`.

use std::fmt;

use thiserror::Error;

use super::ProviderKey;

/// Provider-independent error kinds with special orchestrator handling.
///
/// The set is closed: new kinds are added here, never by adapters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CanonicalError {
    /// The credential is invalid or revoked. The orchestrator blacklists it.
    BadToken,
    /// The account exists but is not allowed to perform the operation.
    AccessDenied,
    /// The provider blocks requests from the caller's network.
    AccessBlocked,
}

impl CanonicalError {
    /// Stable label used in logs and error entries.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::BadToken => "bad_token",
            Self::AccessDenied => "access_denied",
            Self::AccessBlocked => "access_blocked",
        }
    }
}

impl fmt::Display for CanonicalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw failure raised by a provider adapter.
///
/// `Clone` so a single in-flight result can be broadcast to every caller
/// attached to the same dedup queue entry.
#[derive(Debug, Clone, Error)]
pub enum ProviderError {
    /// Transport-level failure (DNS, connect, TLS, timeout).
    #[error("cannot reach {provider}: {message}\n  Suggestion: Check connectivity to the provider API")]
    Network {
        /// Provider that was called.
        provider: ProviderKey,
        /// Transport error description.
        message: String,
        /// Whether the request timed out.
        timeout: bool,
    },

    /// Non-success HTTP status without a recognizable API error body.
    #[error("{provider} returned HTTP {status}\n  Suggestion: {suggestion}")]
    HttpStatus {
        /// Provider that was called.
        provider: ProviderKey,
        /// HTTP status code.
        status: u16,
        /// Raw response body (truncated).
        body: String,
        /// The Retry-After header value, if present.
        retry_after: Option<String>,
        /// How to fix the issue.
        suggestion: String,
    },

    /// Provider API error with a provider-specific code.
    #[error("{provider} rejected the request with '{code}': {message}")]
    Api {
        /// Provider that was called.
        provider: ProviderKey,
        /// Provider error code (`bad_token`, `AUTH_BAD_APIKEY`, `8`, ...).
        code: String,
        /// Human-readable message from the provider.
        message: String,
    },

    /// Response could not be decoded or violated the provider contract.
    #[error("unexpected {provider} response: {reason}")]
    UnexpectedResponse {
        /// Provider that was called.
        provider: ProviderKey,
        /// What was wrong with the response.
        reason: String,
    },

    /// The remote torrent has no file matching the request.
    #[error("no {provider} file found for {info_hash} [{file_index}]")]
    FileNotFound {
        /// Provider that was called.
        provider: ProviderKey,
        /// Torrent info hash.
        info_hash: String,
        /// Requested file index, or `none`.
        file_index: String,
    },

    /// The remote torrent ended in a state the adapter cannot act on.
    #[error("{provider} failed adding torrent {info_hash}: {reason}")]
    TorrentFailed {
        /// Provider that was called.
        provider: ProviderKey,
        /// Torrent info hash.
        info_hash: String,
        /// Why the torrent cannot be resolved.
        reason: String,
    },

    /// The credential does not have the shape the provider expects.
    #[error("invalid {provider} credential: {reason}\n  Suggestion: Reconfigure the provider credential")]
    InvalidCredential {
        /// Provider the credential belongs to.
        provider: ProviderKey,
        /// What is malformed.
        reason: String,
    },

    /// The adapter's HTTP client could not be constructed.
    #[error("{provider} client unavailable: {reason}")]
    ClientUnavailable {
        /// Provider whose client failed.
        provider: ProviderKey,
        /// Construction failure.
        reason: String,
    },
}

const MAX_BODY_CHARS: usize = 512;

impl ProviderError {
    /// Creates a `Network` error from a transport failure.
    #[must_use]
    pub fn network(provider: ProviderKey, error: &reqwest::Error) -> Self {
        Self::Network {
            provider,
            message: error.to_string(),
            timeout: error.is_timeout(),
        }
    }

    /// Creates an `HttpStatus` error, truncating the body.
    #[must_use]
    pub fn http_status(
        provider: ProviderKey,
        status: u16,
        body: &str,
        retry_after: Option<String>,
    ) -> Self {
        let suggestion = match status {
            401 | 403 => "Check that the provider credential is valid and the plan is active",
            429 => "The provider is rate limiting; retry later",
            s if s >= 500 => "The provider API is unavailable; retry later",
            _ => "Check the request parameters",
        };
        Self::HttpStatus {
            provider,
            status,
            body: body.chars().take(MAX_BODY_CHARS).collect(),
            retry_after,
            suggestion: suggestion.to_string(),
        }
    }

    /// Creates an `Api` error.
    #[must_use]
    pub fn api(provider: ProviderKey, code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Api {
            provider,
            code: code.into(),
            message: message.into(),
        }
    }

    /// Creates an `UnexpectedResponse` error.
    #[must_use]
    pub fn unexpected(provider: ProviderKey, reason: impl Into<String>) -> Self {
        Self::UnexpectedResponse {
            provider,
            reason: reason.into(),
        }
    }

    /// Creates a `FileNotFound` error.
    #[must_use]
    pub fn file_not_found(provider: ProviderKey, info_hash: &str, file_index: Option<u32>) -> Self {
        Self::FileNotFound {
            provider,
            info_hash: info_hash.to_string(),
            file_index: file_index.map_or_else(|| "none".to_string(), |i| i.to_string()),
        }
    }

    /// Creates a `TorrentFailed` error.
    #[must_use]
    pub fn torrent_failed(provider: ProviderKey, info_hash: &str, reason: impl Into<String>) -> Self {
        Self::TorrentFailed {
            provider,
            info_hash: info_hash.to_string(),
            reason: reason.into(),
        }
    }

    /// Creates an `InvalidCredential` error.
    #[must_use]
    pub fn invalid_credential(provider: ProviderKey, reason: impl Into<String>) -> Self {
        Self::InvalidCredential {
            provider,
            reason: reason.into(),
        }
    }

    /// The provider that produced this error.
    #[must_use]
    pub fn provider(&self) -> ProviderKey {
        match self {
            Self::Network { provider, .. }
            | Self::HttpStatus { provider, .. }
            | Self::Api { provider, .. }
            | Self::UnexpectedResponse { provider, .. }
            | Self::FileNotFound { provider, .. }
            | Self::TorrentFailed { provider, .. }
            | Self::InvalidCredential { provider, .. }
            | Self::ClientUnavailable { provider, .. } => *provider,
        }
    }

    /// Provider API error code, when the provider sent one.
    #[must_use]
    pub fn api_code(&self) -> Option<&str> {
        match self {
            Self::Api { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    /// Provider API error message, when the provider sent one.
    #[must_use]
    pub fn api_message(&self) -> Option<&str> {
        match self {
            Self::Api { message, .. } => Some(message.as_str()),
            _ => None,
        }
    }

    /// HTTP status attached to the error, if any.
    #[must_use]
    pub fn http_status_code(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }

    /// True when the provider API reported one of `codes`.
    #[must_use]
    pub fn has_code(&self, codes: &[&str]) -> bool {
        self.api_code().is_some_and(|code| codes.contains(&code))
    }
}
