//! Torrent catalog collaborator.
//!
//! The catalog is owned by the scraper side of the system. The resolver
//! only reads torrent metadata from it to enrich magnet links.

use std::path::Path;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use sqlx::Row;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use thiserror::Error;
use tracing::instrument;

/// Content type of a catalog torrent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TorrentKind {
    /// Feature film.
    Movie,
    /// TV series.
    Series,
    /// Anime.
    Anime,
    /// Anything else.
    #[default]
    Other,
}

impl TorrentKind {
    fn parse(value: &str) -> Self {
        match value.to_ascii_lowercase().as_str() {
            "movie" => Self::Movie,
            "series" => Self::Series,
            "anime" => Self::Anime,
            _ => Self::Other,
        }
    }
}

/// Catalog metadata for one torrent.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TorrentInfo {
    /// Info hash (lowercase).
    pub info_hash: String,
    /// Torrent title.
    pub title: String,
    /// Content type.
    pub kind: TorrentKind,
    /// Source site the torrent was scraped from.
    pub source: Option<String>,
    /// Announce URLs recorded for the torrent.
    pub trackers: Vec<String>,
}

/// Repository errors.
#[derive(Debug, Error)]
pub enum RepositoryError {
    /// The catalog store failed.
    #[error("torrent catalog query failed: {0}")]
    Query(#[from] sqlx::Error),
}

/// Read access to the torrent catalog.
#[async_trait]
pub trait TorrentRepository: Send + Sync {
    /// Looks a torrent up by info hash.
    async fn get_torrent_by_hash(&self, info_hash: &str) -> Result<Option<TorrentInfo>, RepositoryError>;
}

/// Catalog kept in memory. Empty by default, which disables tracker enrichment.
#[derive(Debug, Default)]
pub struct InMemoryTorrentRepository {
    torrents: DashMap<String, TorrentInfo>,
}

impl InMemoryTorrentRepository {
    /// Creates an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds or replaces a torrent.
    pub fn insert(&self, torrent: TorrentInfo) {
        self.torrents
            .insert(torrent.info_hash.to_lowercase(), torrent);
    }
}

#[async_trait]
impl TorrentRepository for InMemoryTorrentRepository {
    async fn get_torrent_by_hash(&self, info_hash: &str) -> Result<Option<TorrentInfo>, RepositoryError> {
        Ok(self
            .torrents
            .get(&info_hash.to_lowercase())
            .map(|entry| entry.value().clone()))
    }
}

/// Read-only view of a SQLite catalog with a `torrents` table
/// (`info_hash`, `title`, `type`, `provider`, comma-separated `trackers`).
#[derive(Debug, Clone)]
pub struct SqliteTorrentRepository {
    pool: SqlitePool,
}

impl SqliteTorrentRepository {
    /// Opens the catalog at `path` read-only.
    ///
    /// # Errors
    ///
    /// Returns [`RepositoryError::Query`] when the database cannot be opened.
    #[instrument(skip(path), fields(path = %path.display()))]
    pub async fn open(path: &Path) -> Result<Self, RepositoryError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect(&format!("sqlite:{}?mode=ro", path.display()))
            .await?;
        Ok(Self { pool })
    }

    /// Wraps an existing pool.
    #[must_use]
    pub fn from_pool(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl TorrentRepository for SqliteTorrentRepository {
    #[instrument(skip(self))]
    async fn get_torrent_by_hash(&self, info_hash: &str) -> Result<Option<TorrentInfo>, RepositoryError> {
        let row = sqlx::query(
            "SELECT info_hash, title, type, provider, trackers FROM torrents WHERE info_hash = ?",
        )
        .bind(info_hash.to_lowercase())
        .fetch_optional(&self.pool)
        .await?;

        let Some(row) = row else {
            return Ok(None);
        };
        let kind: Option<String> = row.try_get("type")?;
        let trackers: Option<String> = row.try_get("trackers")?;
        Ok(Some(TorrentInfo {
            info_hash: row.try_get("info_hash")?,
            title: row.try_get::<Option<String>, _>("title")?.unwrap_or_default(),
            kind: kind.as_deref().map_or(TorrentKind::Other, TorrentKind::parse),
            source: row.try_get("provider")?,
            trackers: split_trackers(trackers.as_deref()),
        }))
    }
}

fn split_trackers(raw: Option<&str>) -> Vec<String> {
    raw.map(|raw| {
        raw.split(',')
            .map(str::trim)
            .filter(|tracker| !tracker.is_empty())
            .map(str::to_string)
            .collect()
    })
    .unwrap_or_default()
}
