//! CLI argument definitions using clap derive macros.

use std::net::IpAddr;
use std::path::PathBuf;

use clap::Parser;

/// Debrid resolution service.
///
/// Redirects stream links to the file served by the user's debrid provider,
/// or to a short placeholder video explaining why no link is available.
#[derive(Parser, Debug)]
#[command(name = "debrid-resolver")]
#[command(author, version, about)]
pub struct Args {
    /// Increase output verbosity (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Suppress non-error output
    #[arg(short, long)]
    pub quiet: bool,

    /// Config file (default: $XDG_CONFIG_HOME/debrid-resolver/config.toml)
    #[arg(long, value_name = "PATH")]
    pub config: Option<PathBuf>,

    /// Address to listen on
    #[arg(long, env = "RESOLVER_BIND")]
    pub bind: Option<IpAddr>,

    /// Port to listen on
    #[arg(short, long, env = "PORT")]
    pub port: Option<u16>,

    /// Public resolver host used in links and placeholder URLs
    #[arg(long, env = "RESOLVER_HOST")]
    pub host: Option<String>,

    /// Seconds before a resolution answers with a placeholder (1-600)
    #[arg(long, value_parser = clap::value_parser!(u64).range(1..=600))]
    pub resolve_timeout: Option<u64>,

    /// Concurrent operations per provider queue (1-1000)
    #[arg(long)]
    pub queue_concurrency: Option<usize>,

    /// SQLite file for the durable cache tier
    #[arg(long, env = "RESOLVER_CACHE_DB", value_name = "PATH")]
    pub cache_db: Option<PathBuf>,

    /// Disable result memoization
    #[arg(long, env = "NO_CACHE")]
    pub no_cache: bool,

    /// SQLite torrent catalog used to enrich magnet links
    #[arg(long, env = "RESOLVER_CATALOG_DB", value_name = "PATH")]
    pub catalog_db: Option<PathBuf>,

    /// Directory with the placeholder videos served under /videos
    #[arg(long, value_name = "DIR")]
    pub videos_dir: Option<PathBuf>,
}

impl Args {
    /// Default log filter: `-q` wins, else the `-v` count.
    #[must_use]
    pub fn default_log_level(&self) -> &'static str {
        if self.quiet {
            return "error";
        }
        match self.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    }
}
