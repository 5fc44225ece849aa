//! Per-user debrid options parsed from the `debridoptions` setting.

use std::str::FromStr;

/// Configuration key holding the comma-separated option list.
pub const DEBRID_OPTIONS_KEY: &str = "debridoptions";

/// Per-user switches applied when merging availability into candidates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DebridOptions {
    /// Show only cached debrid links.
    pub only_cached_links: bool,
    /// Show only cached debrid links when at least one exists.
    pub only_cached_links_if_available: bool,
    /// Add "download to debrid" links for uncached candidates.
    pub include_download_links: bool,
}

impl DebridOptions {
    /// Parses a list such as `cachedlinks,downloadlinks`. Unknown entries are ignored.
    #[must_use]
    pub fn parse(value: &str) -> Self {
        let mut options = Self::default();
        for option in value.split(',').map(str::trim) {
            match option.to_ascii_lowercase().as_str() {
                "cachedlinks" => options.only_cached_links = true,
                "cachedlinksifavailable" => options.only_cached_links_if_available = true,
                "downloadlinks" => options.include_download_links = true,
                _ => {}
            }
        }
        options
    }
}

impl FromStr for DebridOptions {
    type Err = std::convert::Infallible;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(value))
    }
}
