//! Inbound chat message model (§3 `IMMessage`, §6 Transport contract).

use serde::{Deserialize, Serialize};

use crate::models::session::ConversationKey;

/// Kind of media an [`Attachment`] carries.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AttachmentType {
    /// Still image.
    Image,
    /// Video clip.
    Video,
    /// Audio clip or voice note.
    Audio,
    /// Arbitrary file.
    File,
}

/// A media attachment delivered alongside an [`IMMessage`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment kind.
    pub attachment_type: AttachmentType,
    /// Path to the locally downloaded file.
    pub local_path: String,
    /// Original file name, if known.
    pub name: Option<String>,
    /// MIME type, if known.
    pub mime: Option<String>,
    /// Size in bytes.
    pub size: Option<u64>,
    /// `(width, height)` in pixels, for image/video.
    pub dimensions: Option<(u32, u32)>,
    /// Duration in seconds, for audio/video.
    pub duration_seconds: Option<f64>,
}

/// One inbound message emitted by a [`crate::transport::Transport`].
///
/// Immutable once constructed; consumed exactly once by the multiplexer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IMMessage {
    /// Originating chat platform (e.g. `"telegram"`, `"wecom"`).
    pub platform: String,
    /// Platform-scoped conversation identifier.
    pub conversation_id: String,
    /// Platform-scoped message identifier.
    pub message_id: String,
    /// Platform-scoped sender identifier.
    pub sender_id: String,
    /// Raw message text.
    pub content: String,
    /// Media attachments, if any.
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    /// Groups attachments sent as a single logical album/media-group.
    pub media_group_id: Option<String>,
    /// Unix timestamp (milliseconds) the platform reported for this message.
    pub timestamp_ms: i64,
}

impl IMMessage {
    /// The conversation key this message routes through.
    #[must_use]
    pub fn conversation_key(&self) -> ConversationKey {
        ConversationKey::new(self.platform.clone(), self.conversation_id.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conversation_key_derives_from_platform_and_conversation_id() {
        let msg = IMMessage {
            platform: "discord".into(),
            conversation_id: "chan-1".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            content: "hi".into(),
            attachments: Vec::new(),
            media_group_id: None,
            timestamp_ms: 0,
        };
        let key = msg.conversation_key();
        assert_eq!(key.platform, "discord");
        assert_eq!(key.conversation_id, "chan-1");
    }
}
