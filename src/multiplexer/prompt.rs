//! Prompt formatting: the deterministic attachment block and
//! skills-auto-routing composition (§4.1 "Turn dispatch" steps 2-3).

use crate::models::im_message::{Attachment, IMMessage};

/// Concatenate raw message text with a deterministic, one-line-per-
/// attachment block.
#[must_use]
pub fn format_turn_prompt(message: &IMMessage) -> String {
    if message.attachments.is_empty() {
        return message.content.clone();
    }

    let mut out = message.content.clone();
    if !out.is_empty() {
        out.push('\n');
    }
    for attachment in &message.attachments {
        out.push_str(&format_attachment_line(attachment));
        out.push('\n');
    }
    out.trim_end().to_owned()
}

fn format_attachment_line(attachment: &Attachment) -> String {
    let name = attachment.name.as_deref().unwrap_or("unknown");
    let mime = attachment.mime.as_deref().unwrap_or("application/octet-stream");
    let size_kb = attachment.size.unwrap_or(0) / 1024;
    let mut line = format!(
        "- type: {}, path: {}, name: {}, mime: {}, size: {}kb",
        attachment_type_label(attachment),
        attachment.local_path,
        name,
        mime,
        size_kb,
    );
    if let Some((w, h)) = attachment.dimensions {
        line.push_str(&format!(", dims: {w}x{h}"));
    }
    if let Some(duration) = attachment.duration_seconds {
        line.push_str(&format!(", duration: {duration}s"));
    }
    line
}

fn attachment_type_label(attachment: &Attachment) -> &'static str {
    use crate::models::im_message::AttachmentType;
    match attachment.attachment_type {
        AttachmentType::Image => "image",
        AttachmentType::Video => "video",
        AttachmentType::Audio => "audio",
        AttachmentType::File => "file",
    }
}

/// Compose the effective system prompt by optionally prepending a
/// skills-auto-routing block ahead of the session's stored prompt.
///
/// Returns the stored prompt unchanged when no skills are routed.
#[must_use]
pub fn compose_system_prompt(stored_prompt: &str, skill_ids: &[String]) -> String {
    if skill_ids.is_empty() {
        return stored_prompt.to_owned();
    }
    let routed = skill_ids.join(", ");
    format!("The following skills are available for this turn: {routed}.\n\n{stored_prompt}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::im_message::AttachmentType;

    fn sample_message(content: &str, attachments: Vec<Attachment>) -> IMMessage {
        IMMessage {
            platform: "telegram".into(),
            conversation_id: "123".into(),
            message_id: "m1".into(),
            sender_id: "u1".into(),
            content: content.into(),
            attachments,
            media_group_id: None,
            timestamp_ms: 0,
        }
    }

    #[test]
    fn no_attachments_returns_content_unchanged() {
        let message = sample_message("hello", vec![]);
        assert_eq!(format_turn_prompt(&message), "hello");
    }

    #[test]
    fn attachment_block_is_one_line_per_attachment() {
        let attachment = Attachment {
            attachment_type: AttachmentType::Image,
            local_path: "/tmp/a.png".into(),
            name: Some("a.png".into()),
            mime: Some("image/png".into()),
            size: Some(2048),
            dimensions: Some((100, 200)),
            duration_seconds: None,
        };
        let message = sample_message("check this out", vec![attachment]);
        let prompt = format_turn_prompt(&message);
        assert!(prompt.starts_with("check this out\n"));
        assert!(prompt.contains("type: image, path: /tmp/a.png, name: a.png, mime: image/png, size: 2kb, dims: 100x200"));
    }

    #[test]
    fn compose_with_no_skills_returns_stored_prompt_unchanged() {
        assert_eq!(compose_system_prompt("you are helpful", &[]), "you are helpful");
    }

    #[test]
    fn compose_with_skills_prepends_routing_block() {
        let composed = compose_system_prompt("you are helpful", &["deploy".to_owned(), "triage".to_owned()]);
        assert!(composed.starts_with("The following skills are available for this turn: deploy, triage."));
        assert!(composed.ends_with("you are helpful"));
    }
}
