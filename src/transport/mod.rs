//! Chat-platform transport abstraction (§6 "Transport inbound contract").
//!
//! Grounded on the teacher's `driver::AgentDriver` — a protocol-agnostic
//! trait returning boxed futures so platform adapters stay object-safe
//! behind `Arc<dyn Transport>` — retargeted from MCP/ACP agent protocols
//! to inbound chat platforms. [`telegram`] is the one reference adapter
//! built to full depth; [`wecom`] implements only the callback decode/
//! verify framing named in §6, not a running relay server.

pub mod telegram;
pub mod wecom;

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::models::im_message::IMMessage;
use crate::{AppError, Result};

/// Maximum characters sent in a single outbound chat message before
/// splitting (§6).
pub const MAX_MESSAGE_CHARS: usize = 4000;
/// Retry attempts for a single media upload (§6).
pub const MEDIA_UPLOAD_RETRIES: u32 = 3;
/// Backoff between media upload retries (§6).
pub const MEDIA_UPLOAD_BACKOFF: Duration = Duration::from_secs(2);

/// A boxed future, used to keep transport traits object-safe.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A callback a [`Transport`] hands the multiplexer alongside each inbound
/// [`IMMessage`]: sends `text` back to the originating conversation,
/// applying the inbound contract's media/splitting/fallback rules.
pub type ReplyFn = Arc<dyn Fn(String) -> BoxFuture<'static, Result<()>> + Send + Sync>;

/// One chat-platform adapter. Implementations own their own connection
/// lifecycle and deliver inbound messages to a multiplexer-supplied sink.
pub trait Transport: Send + Sync {
    /// The platform name this transport answers for (`"telegram"`, etc.).
    fn platform(&self) -> &'static str;

    /// Start the transport's connection/poll loop. Returns once the loop
    /// exits (on cancellation or unrecoverable error).
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if the connection cannot be
    /// established.
    fn run(&self) -> BoxFuture<'_, Result<()>>;

    /// Whether the transport currently believes it holds a live
    /// connection to the platform.
    fn is_connected(&self) -> bool;

    /// Send an out-of-band notification (not a reply to any particular
    /// inbound message) to the platform's configured notification target.
    ///
    /// # Errors
    ///
    /// Returns `AppError::Transport` if no target is configured or the
    /// send fails.
    fn send_notification(&self, text: &str) -> BoxFuture<'_, Result<()>>;

    /// The last transient error observed by the connection loop, if any
    /// (§4.3 `testGateway` "last-error surfacing").
    fn last_error(&self) -> Option<String>;
}

/// Split `text` into chunks no longer than [`MAX_MESSAGE_CHARS`], breaking
/// at the last newline in range, else the last space, else forcing a cut
/// (§6 rule d).
#[must_use]
pub fn split_for_delivery(text: &str) -> Vec<String> {
    if text.chars().count() <= MAX_MESSAGE_CHARS {
        return vec![text.to_owned()];
    }

    let chars: Vec<char> = text.chars().collect();
    let mut chunks = Vec::new();
    let mut start = 0;

    while start < chars.len() {
        let remaining = chars.len() - start;
        if remaining <= MAX_MESSAGE_CHARS {
            chunks.push(chars[start..].iter().collect());
            break;
        }

        let window = &chars[start..start + MAX_MESSAGE_CHARS];
        let split_at = window
            .iter()
            .rposition(|c| *c == '\n')
            .or_else(|| window.iter().rposition(|c| *c == ' '))
            .map_or(MAX_MESSAGE_CHARS, |pos| pos + 1);

        chunks.push(chars[start..start + split_at].iter().collect());
        start += split_at;
    }

    chunks
}

/// Expand a leading `~/` in a media-marker path to the process's home
/// directory (§6 rule b). Paths without the prefix pass through unchanged.
#[must_use]
pub fn expand_home(path: &str) -> String {
    let Some(rest) = path.strip_prefix("~/") else {
        return path.to_owned();
    };
    match std::env::var("HOME") {
        Ok(home) => format!("{}/{}", home.trim_end_matches('/'), rest),
        Err(_) => path.to_owned(),
    }
}

/// A media marker extracted from reply text: a deterministic token
/// referencing a local file path previously emitted by a skill
/// (§6 rule a). Markers look like `[[media:/path/to/file.png]]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaMarker {
    /// Position of the marker in the source text, in bytes.
    pub start: usize,
    /// Byte length of the marker, including delimiters.
    pub len: usize,
    /// The local path referenced by the marker, with `~/` expanded.
    pub local_path: String,
}

const MARKER_PREFIX: &str = "[[media:";
const MARKER_SUFFIX: &str = "]]";

/// Parse every `[[media:<path>]]` marker out of `text`, in order of
/// appearance.
#[must_use]
pub fn parse_media_markers(text: &str) -> Vec<MediaMarker> {
    let mut markers = Vec::new();
    let mut search_from = 0;

    while let Some(rel_start) = text[search_from..].find(MARKER_PREFIX) {
        let start = search_from + rel_start;
        let path_start = start + MARKER_PREFIX.len();
        let Some(rel_end) = text[path_start..].find(MARKER_SUFFIX) else {
            break;
        };
        let end = path_start + rel_end + MARKER_SUFFIX.len();
        let raw_path = &text[path_start..path_start + rel_end];
        markers.push(MediaMarker {
            start,
            len: end - start,
            local_path: expand_home(raw_path),
        });
        search_from = end;
    }

    markers
}

/// Strip every media marker out of `text`, leaving the remaining prose
/// intact (used after markers are extracted for separate upload).
#[must_use]
pub fn strip_media_markers(text: &str) -> String {
    let markers = parse_media_markers(text);
    if markers.is_empty() {
        return text.to_owned();
    }
    let mut out = String::with_capacity(text.len());
    let mut cursor = 0;
    for marker in &markers {
        out.push_str(&text[cursor..marker.start]);
        cursor = marker.start + marker.len;
    }
    out.push_str(&text[cursor..]);
    out.trim().to_owned()
}

/// Upload one media file with up to [`MEDIA_UPLOAD_RETRIES`] attempts and
/// [`MEDIA_UPLOAD_BACKOFF`] between them (§6 rule c).
///
/// # Errors
///
/// Returns the last attempt's error if every retry fails.
pub async fn upload_with_retry<F, Fut>(local_path: &str, mut upload: F) -> Result<()>
where
    F: FnMut(String) -> Fut,
    Fut: Future<Output = Result<()>>,
{
    let mut last_err = None;
    for attempt in 1..=MEDIA_UPLOAD_RETRIES {
        match upload(local_path.to_owned()).await {
            Ok(()) => return Ok(()),
            Err(err) => {
                warn!(%local_path, attempt, %err, "media upload attempt failed");
                last_err = Some(err);
                if attempt < MEDIA_UPLOAD_RETRIES {
                    tokio::time::sleep(MEDIA_UPLOAD_BACKOFF).await;
                }
            }
        }
    }
    Err(last_err.unwrap_or_else(|| AppError::Transport(format!("upload of {local_path} failed"))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn split_for_delivery_returns_single_chunk_under_cap() {
        let text = "hello world";
        assert_eq!(split_for_delivery(text), vec![text.to_owned()]);
    }

    #[test]
    fn split_for_delivery_breaks_at_last_newline_in_window() {
        let mut text = "a".repeat(MAX_MESSAGE_CHARS - 10);
        text.push('\n');
        text.push_str(&"b".repeat(20));
        let chunks = split_for_delivery(&text);
        assert_eq!(chunks.len(), 2);
        assert!(chunks[0].ends_with('\n') || !chunks[0].contains('b'));
    }

    #[test]
    fn split_for_delivery_forces_cut_with_no_whitespace() {
        let text = "a".repeat(MAX_MESSAGE_CHARS * 2 + 5);
        let chunks = split_for_delivery(&text);
        assert!(chunks.len() >= 2);
        assert!(chunks[0].chars().count() <= MAX_MESSAGE_CHARS);
    }

    #[test]
    fn parse_media_markers_extracts_path_and_position() {
        let text = "here is a chart [[media:/tmp/out.png]] enjoy";
        let markers = parse_media_markers(text);
        assert_eq!(markers.len(), 1);
        assert_eq!(markers[0].local_path, "/tmp/out.png");
    }

    #[test]
    fn expand_home_rewrites_tilde_prefix() {
        std::env::set_var("HOME", "/home/tester");
        assert_eq!(expand_home("~/out.png"), "/home/tester/out.png");
        assert_eq!(expand_home("/abs/out.png"), "/abs/out.png");
    }

    #[test]
    fn strip_media_markers_removes_marker_text_only() {
        let text = "chart: [[media:/tmp/a.png]] done";
        assert_eq!(strip_media_markers(text), "chart:  done".trim());
    }
}
