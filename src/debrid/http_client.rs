//! Shared HTTP client construction and request execution for provider adapters.
//!
//! All adapters build their `reqwest` client here so timeouts, User-Agent,
//! compression and proxy handling stay identical across providers.
//! [`ProviderHttp`] adds transient-failure retries on top of the client and
//! hands the raw response back to the adapter, which owns the decoding of its
//! provider's error envelope.

use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::time::Duration;

use reqwest::header::{CONTENT_TYPE, RETRY_AFTER};
use reqwest::{Client, ClientBuilder, Proxy, RequestBuilder};
use serde::de::DeserializeOwned;
use tracing::{debug, warn};
use url::Url;

use crate::user_agent;

use super::ProviderKey;
use super::error::ProviderError;
use super::retry::{RetryDecision, RetryPolicy, classify_error};

const CONNECT_TIMEOUT_SECS: u64 = 10;
const READ_TIMEOUT_SECS: u64 = 30;

/// Network settings shared by every provider client.
#[derive(Debug, Clone)]
pub struct ProviderHttpSettings {
    /// TCP/TLS connect timeout.
    pub connect_timeout: Duration,
    /// Whole-request timeout.
    pub read_timeout: Duration,
    /// Attempts per call for transient failures (including the first).
    pub retry_attempts: u32,
}

impl Default for ProviderHttpSettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(CONNECT_TIMEOUT_SECS),
            read_timeout: Duration::from_secs(READ_TIMEOUT_SECS),
            retry_attempts: super::retry::DEFAULT_MAX_ATTEMPTS,
        }
    }
}

/// Builds a provider HTTP client using the shared policy.
///
/// # Errors
///
/// Returns [`ProviderError::ClientUnavailable`] when client construction fails.
pub fn build_provider_http_client(
    provider: ProviderKey,
    settings: &ProviderHttpSettings,
) -> Result<Client, ProviderError> {
    let user_agent = user_agent::default_provider_user_agent();

    match try_build_client(&user_agent, settings, false) {
        Ok(client) => Ok(client),
        Err(BuildClientFailure::Panic) => {
            // Some sandboxed environments panic when querying system proxy
            // settings. Retry with env proxies only.
            warn!(
                provider = %provider,
                "Provider client hit system proxy panic; using env-proxy fallback builder"
            );
            try_build_client(&user_agent, settings, true).map_err(|failure| {
                ProviderError::ClientUnavailable {
                    provider,
                    reason: failure.to_string(),
                }
            })
        }
        Err(failure) => Err(ProviderError::ClientUnavailable {
            provider,
            reason: failure.to_string(),
        }),
    }
}

enum BuildClientFailure {
    Panic,
    Build(reqwest::Error),
}

impl fmt::Display for BuildClientFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Panic => f.write_str("HTTP client construction panicked"),
            Self::Build(error) => write!(f, "HTTP client construction failed: {error}"),
        }
    }
}

fn try_build_client(
    user_agent: &str,
    settings: &ProviderHttpSettings,
    disable_system_proxy_lookup: bool,
) -> Result<Client, BuildClientFailure> {
    let user_agent = user_agent.to_string();
    let settings = settings.clone();
    catch_unwind(AssertUnwindSafe(move || {
        let mut builder = base_builder(user_agent, &settings);
        if disable_system_proxy_lookup {
            builder = apply_env_proxy_fallback(builder.no_proxy());
        }
        builder.build().map_err(BuildClientFailure::Build)
    }))
    .map_err(|_| BuildClientFailure::Panic)?
}

fn base_builder(user_agent: String, settings: &ProviderHttpSettings) -> ClientBuilder {
    Client::builder()
        .connect_timeout(settings.connect_timeout)
        .timeout(settings.read_timeout)
        .user_agent(user_agent)
        .gzip(true)
}

fn apply_env_proxy_fallback(mut builder: ClientBuilder) -> ClientBuilder {
    if let Some(proxy) = find_first_env(&["HTTPS_PROXY", "https_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::https(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    if let Some(proxy) = find_first_env(&["HTTP_PROXY", "http_proxy", "ALL_PROXY", "all_proxy"])
        && let Ok(resolved) = Proxy::http(&proxy)
    {
        builder = builder.proxy(resolved);
    }
    builder
}

fn find_first_env(names: &[&str]) -> Option<String> {
    names.iter().find_map(|name| {
        std::env::var(name)
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
    })
}

/// Raw provider response after transport retries.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    /// HTTP status code.
    pub status: u16,
    /// Response body as text.
    pub body: String,
    /// Retry-After header, if any.
    pub retry_after: Option<String>,
}

impl ApiResponse {
    /// True for 2xx statuses.
    #[must_use]
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Decodes the body as JSON.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnexpectedResponse`] when the body does not
    /// match `T`.
    pub fn json<T: DeserializeOwned>(&self, provider: ProviderKey) -> Result<T, ProviderError> {
        serde_json::from_str(&self.body).map_err(|error| {
            ProviderError::unexpected(
                provider,
                format!("HTTP {} body did not decode: {error}", self.status),
            )
        })
    }

    /// Converts a non-success response without a known API envelope into an error.
    #[must_use]
    pub fn into_status_error(self, provider: ProviderKey) -> ProviderError {
        ProviderError::http_status(provider, self.status, &self.body, self.retry_after)
    }
}

/// HTTP access to one provider API: client, base URL and retry policy.
#[derive(Clone)]
pub struct ProviderHttp {
    provider: ProviderKey,
    client: Client,
    base_url: String,
    retry: RetryPolicy,
}

impl fmt::Debug for ProviderHttp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProviderHttp")
            .field("provider", &self.provider)
            .field("base_url", &self.base_url)
            .field("max_attempts", &self.retry.max_attempts())
            .finish_non_exhaustive()
    }
}

impl ProviderHttp {
    /// Creates provider HTTP access against `base_url`.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::ClientUnavailable`] when the client cannot be built.
    pub fn new(
        provider: ProviderKey,
        base_url: impl Into<String>,
        settings: &ProviderHttpSettings,
    ) -> Result<Self, ProviderError> {
        Ok(Self {
            provider,
            client: build_provider_http_client(provider, settings)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            retry: RetryPolicy::with_max_attempts(settings.retry_attempts),
        })
    }

    /// The provider this client talks to.
    #[must_use]
    pub fn provider(&self) -> ProviderKey {
        self.provider
    }

    /// Underlying client, for adapters that build ad-hoc requests.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Builds `{base_url}/{path}` with `query` appended.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::UnexpectedResponse`] when the URL cannot be parsed.
    pub fn endpoint(&self, path: &str, query: &[(&str, &str)]) -> Result<Url, ProviderError> {
        let raw = format!("{}/{}", self.base_url, path.trim_start_matches('/'));
        let mut url = Url::parse(&raw).map_err(|error| {
            ProviderError::unexpected(self.provider, format!("invalid endpoint '{raw}': {error}"))
        })?;
        if !query.is_empty() {
            url.query_pairs_mut().extend_pairs(query);
        }
        Ok(url)
    }

    /// Sends the request produced by `build`, retrying transient failures.
    ///
    /// `build` is called once per attempt. Non-transient HTTP statuses, and
    /// transient ones once retries are exhausted, are returned as an
    /// [`ApiResponse`] so the adapter can decode its error envelope.
    ///
    /// # Errors
    ///
    /// Returns [`ProviderError::Network`] when the request cannot be sent.
    pub async fn execute<F>(&self, build: F) -> Result<ApiResponse, ProviderError>
    where
        F: Fn(&Client) -> RequestBuilder,
    {
        let mut attempt = 1;
        loop {
            let outcome = match build(&self.client).send().await {
                Ok(response) => {
                    let status = response.status().as_u16();
                    let retry_after = response
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|value| value.to_str().ok())
                        .map(str::to_string);
                    let body = response
                        .text()
                        .await
                        .map_err(|error| ProviderError::network(self.provider, &error))?;
                    Ok(ApiResponse {
                        status,
                        body,
                        retry_after,
                    })
                }
                Err(error) => Err(ProviderError::network(self.provider, &error)),
            };

            let failure = match &outcome {
                Ok(response) if response.is_success() => return outcome,
                Ok(response) => response.clone().into_status_error(self.provider),
                Err(error) => error.clone(),
            };

            match self.retry.decide(&failure, attempt) {
                RetryDecision::Retry {
                    delay,
                    attempt: next,
                } => {
                    debug!(
                        provider = %self.provider,
                        attempt,
                        delay_ms = delay.as_millis(),
                        failure = ?classify_error(&failure),
                        "retrying provider call"
                    );
                    tokio::time::sleep(delay).await;
                    attempt = next;
                }
                RetryDecision::DoNotRetry { .. } => return outcome,
            }
        }
    }

    /// Sends the request and decodes a successful JSON body.
    ///
    /// Suitable for providers whose errors are signalled by HTTP status only.
    ///
    /// # Errors
    ///
    /// Returns the transport error, an [`ProviderError::HttpStatus`] for
    /// non-success responses, or a decode error.
    pub async fn json<T, F>(&self, build: F) -> Result<T, ProviderError>
    where
        T: DeserializeOwned,
        F: Fn(&Client) -> RequestBuilder,
    {
        let response = self.execute(build).await?;
        if !response.is_success() {
            return Err(response.into_status_error(self.provider));
        }
        response.json(self.provider)
    }
}

/// Attaches an `application/x-www-form-urlencoded` body.
#[must_use]
pub fn form_body(builder: RequestBuilder, fields: &[(&str, &str)]) -> RequestBuilder {
    let body = url::form_urlencoded::Serializer::new(String::new())
        .extend_pairs(fields)
        .finish();
    builder
        .header(CONTENT_TYPE, "application/x-www-form-urlencoded")
        .body(body)
}
