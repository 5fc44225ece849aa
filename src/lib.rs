//! Debrid Resolver Core Library
//!
//! Turns torrent stream candidates into playable links served by a debrid
//! provider (Real-Debrid, Premiumize, AllDebrid, Debrid-Link, Offcloud,
//! TorBox, EasyDebrid, Put.io), or into a placeholder video explaining why no
//! link is available.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//! - [`debrid`] - Provider capability contract, adapters and registry
//! - [`orchestrator`] - Resolution orchestration, credential blacklist and
//!   bulk availability merging
//! - [`cache`] - Two-tier (memory + SQLite) result cache
//! - [`queue`] - Per-provider dedup queue
//! - [`magnet`] - Magnet link construction with tracker enrichment
//! - [`repository`] - Torrent catalog lookups
//! - [`server`] - Inbound HTTP resolution endpoint
//! - [`outcome`] - Placeholder outcomes and their media paths
//! - [`config`] / [`cli`] - Layered configuration

// Clippy lints - strict for library code
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod cache;
pub mod cli;
pub mod config;
pub mod db;
pub mod debrid;
pub mod magnet;
pub mod orchestrator;
pub mod outcome;
pub mod queue;
pub mod repository;
pub mod server;
pub mod user_agent;

#[cfg(test)]
pub mod test_support;

// Re-export commonly used types
pub use cache::{KnownCached, Tier, TwoTierCache};
pub use db::Database;
pub use debrid::{
    AvailabilityEntry, AvailabilityMap, CanonicalError, DebridProvider, ProviderError,
    ProviderKey, ProviderRegistry, ResolutionRequest, ResolveOutcome, StreamCandidate,
    build_default_provider_registry,
};
pub use magnet::MagnetBuilder;
pub use orchestrator::{
    AvailabilityChecker, CredentialBlacklist, DebridOptions, DebridStream, Orchestrator,
    OrchestratorError, OrchestratorSettings, Resolution,
};
pub use outcome::StaticOutcome;
pub use queue::{DedupQueue, QueueError};
