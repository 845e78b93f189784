//! On-disk playability checking.
//!
//! A session may only be promoted to READY when, on a single poll, the
//! playlist exists and is non-empty, begins with the `#EXTM3U` marker, and
//! at least one referenced media segment exists non-empty next to it. The
//! read path serves artifacts from the same directory, so READY always
//! means "immediately fetchable".

use std::path::Path;

use tracing::trace;

/// Outcome of one playability poll.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Playability {
    Ready,
    NotReady(&'static str),
}

/// Check the playability condition for `dir`/`playlist_name`.
pub async fn check_playable(dir: &Path, playlist_name: &str) -> Playability {
    let playlist_path = dir.join(playlist_name);
    let bytes = match tokio::fs::read(&playlist_path).await {
        Ok(bytes) => bytes,
        Err(_) => return Playability::NotReady("playlist missing"),
    };
    if bytes.is_empty() {
        return Playability::NotReady("playlist empty");
    }
    if !bytes.starts_with(b"#EXTM3U") {
        return Playability::NotReady("playlist lacks #EXTM3U marker");
    }

    let playlist = match m3u8_rs::parse_media_playlist_res(&bytes) {
        Ok(playlist) => playlist,
        // Still being written by the segmenter.
        Err(_) => return Playability::NotReady("playlist not yet parsable"),
    };

    for segment in &playlist.segments {
        let Some(name) = segment_basename(&segment.uri) else {
            trace!(uri = %segment.uri, "skipping non-local segment reference");
            continue;
        };
        if let Ok(meta) = tokio::fs::metadata(dir.join(name)).await
            && meta.is_file()
            && meta.len() > 0
        {
            return Playability::Ready;
        }
    }

    Playability::NotReady("no non-empty segment on disk")
}

/// Accept only plain basenames; the pipeline writes segments next to the
/// playlist and anything else is not ours to stat.
fn segment_basename(uri: &str) -> Option<&str> {
    let trimmed = uri.trim();
    if trimmed.is_empty() || trimmed.contains('/') || trimmed.contains('\\') || trimmed == ".." {
        return None;
    }
    Some(trimmed)
}
