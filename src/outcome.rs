//! Static placeholder outcomes for resolutions that end without a playable link.
//!
//! A [`StaticOutcome`] is an expected terminal state (still downloading,
//! archive-only torrent, expired subscription, ...). Instead of an error the
//! playback client receives a short placeholder video that explains it.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Path prefix under which placeholder videos are served.
pub const PLACEHOLDER_PATH_PREFIX: &str = "videos";

/// Terminal non-link outcome of a resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StaticOutcome {
    /// The provider accepted the torrent and is still downloading it.
    Downloading,
    /// The account has no access (expired subscription, bad credential).
    FailedAccess,
    /// Only archive files are available for the requested torrent.
    FailedRar,
    /// The provider could not open the torrent (no peers, broken magnet).
    FailedOpening,
    /// Anything unexpected, including timeouts.
    FailedUnexpected,
    /// The provider refused the content on infringement grounds.
    FailedInfringement,
    /// The torrent exceeds the provider's size limit.
    FailedTooBig,
    /// The provider failed downloading the torrent after a retry.
    FailedDownload,
    /// Account traffic or active-item limits are exhausted.
    LimitsExceeded,
    /// The provider blocked access from the caller's network.
    BlockedAccess,
}

impl StaticOutcome {
    /// All outcomes, in registry order.
    pub const ALL: [Self; 10] = [
        Self::Downloading,
        Self::FailedAccess,
        Self::FailedRar,
        Self::FailedOpening,
        Self::FailedUnexpected,
        Self::FailedInfringement,
        Self::FailedTooBig,
        Self::FailedDownload,
        Self::LimitsExceeded,
        Self::BlockedAccess,
    ];

    /// Placeholder media file name for this outcome.
    #[must_use]
    pub fn file_name(self) -> &'static str {
        match self {
            Self::Downloading => "downloading_v2.mp4",
            Self::FailedAccess => "failed_access_v2.mp4",
            Self::FailedRar => "failed_rar_v2.mp4",
            Self::FailedOpening => "failed_opening_v2.mp4",
            Self::FailedUnexpected => "failed_unexpected_v2.mp4",
            Self::FailedInfringement => "failed_infringement_v2.mp4",
            Self::FailedTooBig => "failed_too_big_v1.mp4",
            Self::FailedDownload => "download_failed_v2.mp4",
            Self::LimitsExceeded => "limits_exceeded_v1.mp4",
            Self::BlockedAccess => "blocked_access_v1.mp4",
        }
    }

    /// Relative placeholder path, e.g. `videos/downloading_v2.mp4`.
    #[must_use]
    pub fn path(self) -> String {
        format!("{PLACEHOLDER_PATH_PREFIX}/{}", self.file_name())
    }

    /// Fully qualified placeholder URL under `host`.
    ///
    /// `host` may carry a scheme (`https://resolver.example`) or be a bare
    /// authority (`resolver.example`), in which case `https` is assumed.
    #[must_use]
    pub fn url(self, host: &str) -> String {
        let host = host.trim_end_matches('/');
        if host.starts_with("http://") || host.starts_with("https://") {
            format!("{host}/{}", self.path())
        } else {
            format!("https://{host}/{}", self.path())
        }
    }

    /// Stable snake_case label used in logs.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Downloading => "downloading",
            Self::FailedAccess => "failed_access",
            Self::FailedRar => "failed_rar",
            Self::FailedOpening => "failed_opening",
            Self::FailedUnexpected => "failed_unexpected",
            Self::FailedInfringement => "failed_infringement",
            Self::FailedTooBig => "failed_too_big",
            Self::FailedDownload => "failed_download",
            Self::LimitsExceeded => "limits_exceeded",
            Self::BlockedAccess => "blocked_access",
        }
    }
}

impl fmt::Display for StaticOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
