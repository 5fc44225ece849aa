//! Video and archive detection plus target-file selection on remote torrents.

use std::sync::LazyLock;

use regex::Regex;
use tracing::debug;

const VIDEO_EXTENSIONS: &[&str] = &[
    "3g2", "3gp", "avi", "flv", "mkv", "mk3d", "mov", "mp2", "mp4", "m4v", "mpe", "mpeg", "mpg",
    "mpv", "webm", "wmv", "ogm", "ts", "m2ts",
];

const ARCHIVE_EXTENSIONS: &[&str] = &["rar", "zip"];

/// Video files below this size are treated as samples and not selected.
pub const MIN_VIDEO_SIZE: u64 = 5 * 1024 * 1024;

#[allow(clippy::expect_used)]
static EXTENSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\.(\w{2,4})$").expect("extension regex is valid") // Static pattern, safe to panic
});

fn extension(path: &str) -> Option<String> {
    EXTENSION
        .captures(path)
        .and_then(|captures| captures.get(1))
        .map(|m| m.as_str().to_ascii_lowercase())
}

/// True when `path` has a video extension.
#[must_use]
pub fn is_video(path: &str) -> bool {
    extension(path).is_some_and(|ext| VIDEO_EXTENSIONS.contains(&ext.as_str()))
}

/// True when `path` has an archive extension.
#[must_use]
pub fn is_archive(path: &str) -> bool {
    extension(path).is_some_and(|ext| ARCHIVE_EXTENSIONS.contains(&ext.as_str()))
}

/// Last path component (handles both `/` and `\`).
#[must_use]
pub fn base_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or(path)
}

/// A file inside a remote torrent, normalized across providers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFile {
    /// Index of the file in torrent order, when the provider exposes it.
    pub index: Option<u32>,
    /// Path inside the torrent.
    pub path: String,
    /// Size in bytes.
    pub size: u64,
}

impl RemoteFile {
    /// Creates a file entry.
    #[must_use]
    pub fn new(index: Option<u32>, path: impl Into<String>, size: u64) -> Self {
        Self {
            index,
            path: path.into(),
            size,
        }
    }
}

/// Outcome of target-file selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileSelection<'a> {
    /// A playable video file.
    Video(&'a RemoteFile),
    /// Only archives match; report `FailedRar`.
    OnlyArchives,
    /// Nothing matches.
    NotFound,
}

/// Picks the file a resolution targets.
///
/// Order: explicit index, then name match against `file_name`, then the
/// largest video file. An archive hit, or a torrent whose only candidates
/// are archives, yields [`FileSelection::OnlyArchives`].
#[must_use]
pub fn select_target_file<'a>(
    files: &'a [RemoteFile],
    file_index: Option<u32>,
    file_name: Option<&str>,
) -> FileSelection<'a> {
    if let Some(index) = file_index
        && let Some(file) = files.iter().find(|file| file.index == Some(index))
    {
        return classify(file);
    }

    if let Some(name) = file_name
        && let Some(file) = find_by_name(files, name)
    {
        return classify(file);
    }

    if let Some(file) = largest_video(files) {
        if file_index.is_some() || file_name.is_some() {
            debug!(path = %file.path, "no exact file match; falling back to largest video");
        }
        return FileSelection::Video(file);
    }

    if files.iter().any(|file| is_archive(&file.path)) {
        FileSelection::OnlyArchives
    } else {
        FileSelection::NotFound
    }
}

fn classify(file: &RemoteFile) -> FileSelection<'_> {
    if is_archive(&file.path) {
        FileSelection::OnlyArchives
    } else {
        FileSelection::Video(file)
    }
}

fn find_by_name<'a>(files: &'a [RemoteFile], name: &str) -> Option<&'a RemoteFile> {
    let wanted = base_name(name).to_lowercase();
    files
        .iter()
        .find(|file| base_name(&file.path).to_lowercase() == wanted)
        .or_else(|| {
            files
                .iter()
                .find(|file| file.path.to_lowercase().ends_with(&wanted))
        })
}

/// Largest video file, if any.
#[must_use]
pub fn largest_video(files: &[RemoteFile]) -> Option<&RemoteFile> {
    files
        .iter()
        .filter(|file| is_video(&file.path))
        .max_by_key(|file| file.size)
}

/// Files to select when a provider needs an explicit selection step.
///
/// An explicit `file_index` selects just that file. Otherwise every video at
/// or above [`MIN_VIDEO_SIZE`] is selected; if none qualifies, the largest
/// file is selected so the torrent can still start.
#[must_use]
pub fn files_to_select(files: &[RemoteFile], file_index: Option<u32>) -> Vec<&RemoteFile> {
    if let Some(index) = file_index
        && let Some(file) = files.iter().find(|file| file.index == Some(index))
    {
        return vec![file];
    }

    let videos: Vec<&RemoteFile> = files
        .iter()
        .filter(|file| is_video(&file.path) && file.size >= MIN_VIDEO_SIZE)
        .collect();
    if !videos.is_empty() {
        return videos;
    }

    files.iter().max_by_key(|file| file.size).into_iter().collect()
}
