//! Resolver configuration: config file parsing and layering with CLI flags.
//!
//! Precedence, highest first: command line (and the environment variables
//! clap reads for each flag), the config file, built-in defaults.

use std::env;
use std::fs;
use std::net::{IpAddr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};

use crate::cache::DEFAULT_MEMORY_CAPACITY;
use crate::cli::Args;
use crate::debrid::{DEFAULT_MAX_ATTEMPTS, ProviderHttpSettings};
use crate::magnet::DEFAULT_BEST_TRACKERS_URL;
use crate::orchestrator::OrchestratorSettings;
use crate::queue::DEFAULT_QUEUE_CONCURRENCY;

const APP_DIR: &str = "debrid-resolver";
const DEFAULT_BIND: &str = "0.0.0.0";
const DEFAULT_PORT: u16 = 7050;
const DEFAULT_HOST: &str = "http://localhost:7050";
const DEFAULT_RESOLVE_TIMEOUT_SECS: u64 = 120;
const DEFAULT_PROVIDER_CONNECT_TIMEOUT_SECS: u64 = 10;
const DEFAULT_PROVIDER_READ_TIMEOUT_SECS: u64 = 30;

/// Values read from the `key = value` config file. Every field is optional.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FileConfig {
    /// Listen address.
    pub bind: Option<IpAddr>,
    /// Listen port.
    pub port: Option<u16>,
    /// Public resolver host used in links and placeholder URLs.
    pub host: Option<String>,
    /// Ceiling for one resolution in seconds.
    pub resolve_timeout_secs: Option<u64>,
    /// Provider client connect timeout in seconds.
    pub provider_connect_timeout_secs: Option<u64>,
    /// Provider client read timeout in seconds.
    pub provider_read_timeout_secs: Option<u64>,
    /// Attempts per provider call for transient failures.
    pub provider_retry_attempts: Option<u32>,
    /// Concurrent operations per provider queue.
    pub queue_concurrency: Option<usize>,
    /// SQLite file of the durable cache tier.
    pub cache_db: Option<PathBuf>,
    /// Disable result memoization.
    pub no_cache: Option<bool>,
    /// Memory tier capacity in entries.
    pub memory_cache_capacity: Option<usize>,
    /// Best trackers list URL.
    pub best_trackers_url: Option<String>,
    /// SQLite torrent catalog used for tracker enrichment.
    pub catalog_db: Option<PathBuf>,
    /// Directory holding the placeholder videos.
    pub videos_dir: Option<PathBuf>,
}

impl FileConfig {
    /// Validates values against runtime constraints.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first out-of-range key.
    pub fn validate(&self) -> Result<()> {
        validate_range("resolve_timeout_secs", self.resolve_timeout_secs, 1, 600)?;
        validate_range(
            "provider_connect_timeout_secs",
            self.provider_connect_timeout_secs,
            1,
            3600,
        )?;
        validate_range(
            "provider_read_timeout_secs",
            self.provider_read_timeout_secs,
            1,
            3600,
        )?;
        validate_range(
            "provider_retry_attempts",
            self.provider_retry_attempts.map(u64::from),
            1,
            10,
        )?;
        validate_range(
            "queue_concurrency",
            self.queue_concurrency.map(|value| value as u64),
            1,
            1000,
        )?;
        validate_range(
            "memory_cache_capacity",
            self.memory_cache_capacity.map(|value| value as u64),
            1,
            1_000_000,
        )?;
        if let Some(host) = &self.host
            && host.trim().is_empty()
        {
            bail!("Invalid config value for `host`: must not be empty");
        }
        Ok(())
    }
}

fn validate_range(field: &str, value: Option<u64>, min: u64, max: u64) -> Result<()> {
    let Some(value) = value else {
        return Ok(());
    };
    if !(min..=max).contains(&value) {
        bail!("Invalid config value for `{field}`: {value}. Expected range: {min}..={max}");
    }
    Ok(())
}

/// Resolves the default config path.
///
/// Priority:
/// 1. `$XDG_CONFIG_HOME/debrid-resolver/config.toml`
/// 2. `$HOME/.config/debrid-resolver/config.toml`
#[must_use]
pub fn resolve_default_config_path() -> Option<PathBuf> {
    if let Some(xdg_config_home) = env_var_non_empty_os("XDG_CONFIG_HOME") {
        return Some(PathBuf::from(xdg_config_home).join(APP_DIR).join("config.toml"));
    }
    let home = env_var_non_empty_os("HOME")?;
    Some(
        PathBuf::from(home)
            .join(".config")
            .join(APP_DIR)
            .join("config.toml"),
    )
}

fn env_var_non_empty_os(name: &str) -> Option<std::ffi::OsString> {
    let value = env::var_os(name)?;
    if value.is_empty() { None } else { Some(value) }
}

/// Loads the config file at `explicit`, or at the default path when present.
///
/// An explicit path must exist; a missing default file is not an error.
///
/// # Errors
///
/// Returns an error when the file cannot be read or parsed.
pub fn load_file_config(explicit: Option<&Path>) -> Result<Option<FileConfig>> {
    let path = match explicit {
        Some(path) => path.to_path_buf(),
        None => match resolve_default_config_path() {
            Some(path) if path.exists() => path,
            _ => return Ok(None),
        },
    };
    let raw = fs::read_to_string(&path)
        .with_context(|| format!("Failed to read config file '{}'", path.display()))?;
    parse_config_str(&raw)
        .map(Some)
        .with_context(|| format!("Failed to parse config file '{}'", path.display()))
}

/// Parses `key = value` lines. `#` starts a comment outside quotes.
///
/// # Errors
///
/// Returns an error for bad syntax, unknown keys and invalid values.
pub fn parse_config_str(raw: &str) -> Result<FileConfig> {
    let mut cfg = FileConfig::default();
    for (line_index, raw_line) in raw.lines().enumerate() {
        let line = strip_inline_comment(raw_line).trim();
        if line.is_empty() {
            continue;
        }
        let line_number = line_index + 1;
        let Some((raw_key, raw_value)) = line.split_once('=') else {
            bail!("Invalid config syntax on line {line_number}: expected key = value");
        };
        let key = raw_key.trim();
        let value = raw_value.trim();
        let context = || format!("Invalid `{key}` value on line {line_number}");

        match key {
            "bind" => {
                let parsed = parse_string_literal(value).with_context(context)?;
                cfg.bind = Some(parsed.parse::<IpAddr>().with_context(context)?);
            }
            "port" => {
                let parsed = parse_integer(value).with_context(context)?;
                cfg.port = Some(u16::try_from(parsed).with_context(context)?);
            }
            "host" => cfg.host = Some(parse_string_literal(value).with_context(context)?),
            "resolve_timeout_secs" => {
                cfg.resolve_timeout_secs = Some(parse_integer(value).with_context(context)?);
            }
            "provider_connect_timeout_secs" => {
                cfg.provider_connect_timeout_secs =
                    Some(parse_integer(value).with_context(context)?);
            }
            "provider_read_timeout_secs" => {
                cfg.provider_read_timeout_secs = Some(parse_integer(value).with_context(context)?);
            }
            "provider_retry_attempts" => {
                let parsed = parse_integer(value).with_context(context)?;
                cfg.provider_retry_attempts = Some(u32::try_from(parsed).with_context(context)?);
            }
            "queue_concurrency" => {
                let parsed = parse_integer(value).with_context(context)?;
                cfg.queue_concurrency = Some(usize::try_from(parsed).with_context(context)?);
            }
            "cache_db" => {
                cfg.cache_db = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "no_cache" => cfg.no_cache = Some(parse_boolean(value).with_context(context)?),
            "memory_cache_capacity" => {
                let parsed = parse_integer(value).with_context(context)?;
                cfg.memory_cache_capacity = Some(usize::try_from(parsed).with_context(context)?);
            }
            "best_trackers_url" => {
                cfg.best_trackers_url = Some(parse_string_literal(value).with_context(context)?);
            }
            "catalog_db" => {
                cfg.catalog_db = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            "videos_dir" => {
                cfg.videos_dir = Some(PathBuf::from(parse_string_literal(value).with_context(context)?));
            }
            unknown => bail!("Unknown configuration key: '{unknown}' on line {line_number}"),
        }
    }
    cfg.validate()?;
    Ok(cfg)
}

fn strip_inline_comment(line: &str) -> &str {
    let mut in_string = false;
    for (index, ch) in line.char_indices() {
        match ch {
            '"' => in_string = !in_string,
            '#' if !in_string => return &line[..index],
            _ => {}
        }
    }
    line
}

fn parse_string_literal(raw_value: &str) -> Result<String> {
    if raw_value.len() < 2 || !raw_value.starts_with('"') || !raw_value.ends_with('"') {
        bail!("Expected double-quoted string");
    }
    Ok(raw_value[1..raw_value.len() - 1].to_string())
}

fn parse_integer(raw_value: &str) -> Result<u64> {
    let token = raw_value.trim();
    if token.is_empty() {
        bail!("Expected integer value");
    }
    let value = token.parse::<i128>()?;
    if value < 0 {
        bail!("Expected non-negative integer");
    }
    u64::try_from(value).map_err(|_| anyhow::anyhow!("Integer value out of range for u64"))
}

fn parse_boolean(raw_value: &str) -> Result<bool> {
    match raw_value {
        "true" => Ok(true),
        "false" => Ok(false),
        _ => bail!("Expected boolean value (true or false)"),
    }
}

/// Effective resolver settings after layering.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolverConfig {
    /// Listen socket.
    pub listen: SocketAddr,
    /// Public resolver host.
    pub host: String,
    /// Ceiling for one resolution.
    pub resolve_timeout: Duration,
    /// Provider client connect timeout.
    pub provider_connect_timeout: Duration,
    /// Provider client read timeout.
    pub provider_read_timeout: Duration,
    /// Attempts per provider call for transient failures.
    pub provider_retry_attempts: u32,
    /// Concurrent operations per provider queue.
    pub queue_concurrency: usize,
    /// Durable cache database; `None` disables memoization.
    pub cache_db: Option<PathBuf>,
    /// Memory tier capacity in entries.
    pub memory_cache_capacity: usize,
    /// Best trackers list URL.
    pub best_trackers_url: String,
    /// Torrent catalog database.
    pub catalog_db: Option<PathBuf>,
    /// Placeholder video directory.
    pub videos_dir: Option<PathBuf>,
}

impl ResolverConfig {
    /// Layers `args` over `file` over defaults.
    ///
    /// # Errors
    ///
    /// Returns an error when a layered value is out of range.
    pub fn from_sources(args: &Args, file: Option<&FileConfig>) -> Result<Self> {
        let file = file.cloned().unwrap_or_default();
        let layered = FileConfig {
            bind: args.bind.or(file.bind),
            port: args.port.or(file.port),
            host: args.host.clone().or(file.host),
            resolve_timeout_secs: args.resolve_timeout.or(file.resolve_timeout_secs),
            provider_connect_timeout_secs: file.provider_connect_timeout_secs,
            provider_read_timeout_secs: file.provider_read_timeout_secs,
            provider_retry_attempts: file.provider_retry_attempts,
            queue_concurrency: args.queue_concurrency.or(file.queue_concurrency),
            cache_db: args.cache_db.clone().or(file.cache_db),
            no_cache: Some(args.no_cache || file.no_cache.unwrap_or(false)),
            memory_cache_capacity: file.memory_cache_capacity,
            best_trackers_url: file.best_trackers_url,
            catalog_db: args.catalog_db.clone().or(file.catalog_db),
            videos_dir: args.videos_dir.clone().or(file.videos_dir),
        };
        layered
            .validate()
            .context("Invalid effective resolver configuration")?;

        let bind = layered
            .bind
            .map_or_else(|| DEFAULT_BIND.parse::<IpAddr>(), Ok)
            .context("Invalid default bind address")?;
        let cache_db = if layered.no_cache == Some(true) {
            None
        } else {
            layered.cache_db
        };

        Ok(Self {
            listen: SocketAddr::new(bind, layered.port.unwrap_or(DEFAULT_PORT)),
            host: layered.host.unwrap_or_else(|| DEFAULT_HOST.to_string()),
            resolve_timeout: Duration::from_secs(
                layered.resolve_timeout_secs.unwrap_or(DEFAULT_RESOLVE_TIMEOUT_SECS),
            ),
            provider_connect_timeout: Duration::from_secs(
                layered
                    .provider_connect_timeout_secs
                    .unwrap_or(DEFAULT_PROVIDER_CONNECT_TIMEOUT_SECS),
            ),
            provider_read_timeout: Duration::from_secs(
                layered
                    .provider_read_timeout_secs
                    .unwrap_or(DEFAULT_PROVIDER_READ_TIMEOUT_SECS),
            ),
            provider_retry_attempts: layered
                .provider_retry_attempts
                .unwrap_or(DEFAULT_MAX_ATTEMPTS),
            queue_concurrency: layered.queue_concurrency.unwrap_or(DEFAULT_QUEUE_CONCURRENCY),
            cache_db,
            memory_cache_capacity: layered
                .memory_cache_capacity
                .unwrap_or(DEFAULT_MEMORY_CAPACITY),
            best_trackers_url: layered
                .best_trackers_url
                .unwrap_or_else(|| DEFAULT_BEST_TRACKERS_URL.to_string()),
            catalog_db: layered.catalog_db,
            videos_dir: layered.videos_dir,
        })
    }

    /// Provider client settings.
    #[must_use]
    pub fn provider_http(&self) -> ProviderHttpSettings {
        ProviderHttpSettings {
            connect_timeout: self.provider_connect_timeout,
            read_timeout: self.provider_read_timeout,
            retry_attempts: self.provider_retry_attempts,
        }
    }

    /// Orchestrator settings.
    #[must_use]
    pub fn orchestrator(&self) -> OrchestratorSettings {
        OrchestratorSettings {
            resolve_timeout: self.resolve_timeout,
            queue_concurrency: self.queue_concurrency,
        }
    }
}
