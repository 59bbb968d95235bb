//! Text-confirmation sub-protocol (§4.1 "Pending-permission pre-check").
//!
//! Recognizes a chat reply as an allow/deny answer to the single
//! outstanding [`PendingIMPermission`] for a conversation, with a 60 s
//! auto-deny timeout installed alongside each pending entry.

use std::collections::HashMap;
use std::time::Duration;

use chrono::Utc;

use crate::models::permission::PendingIMPermission;
use crate::models::session::ConversationKey;

/// Hard timeout on an unanswered text confirmation (§5 Timers).
pub const CONFIRMATION_TIMEOUT: Duration = Duration::from_secs(60);

const TRAILING_PUNCTUATION: &[char] = &['.', '!', '?', ',', ';', '。', '，', '！', '？', ':', '：', '；'];

const ALLOW_TOKENS: &[&str] = &["允许", "同意", "yes", "y"];
const DENY_TOKENS: &[&str] = &["拒绝", "不同意", "no", "n"];

/// Outcome of matching a chat reply against the pending confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfirmationMatch {
    /// Reply is empty after normalization; keep the pending entry.
    Empty,
    /// Reply matches the allow set.
    Allow,
    /// Reply matches the deny set.
    Deny,
    /// Reply matches neither; keep the pending entry.
    Unrecognized,
}

/// Strip leading/trailing whitespace, then trailing punctuation, per
/// §4.1 step 1.
#[must_use]
pub fn normalize(content: &str) -> String {
    let trimmed = content.trim();
    trimmed.trim_end_matches(TRAILING_PUNCTUATION).trim().to_owned()
}

/// Classify a normalized reply against the allow/deny token sets,
/// case-insensitive and anchored (the whole normalized reply must equal
/// a token, not merely contain it).
#[must_use]
pub fn classify(normalized: &str) -> ConfirmationMatch {
    if normalized.is_empty() {
        return ConfirmationMatch::Empty;
    }
    let lowered = normalized.to_lowercase();
    if DENY_TOKENS.iter().any(|t| lowered == *t) {
        return ConfirmationMatch::Deny;
    }
    if ALLOW_TOKENS.iter().any(|t| lowered == *t) {
        return ConfirmationMatch::Allow;
    }
    ConfirmationMatch::Unrecognized
}

/// Table of the single outstanding [`PendingIMPermission`] per
/// conversation, mutated only from the multiplexer's own scheduling
/// domain.
#[derive(Default)]
pub struct PendingPermissionTable {
    by_conversation: HashMap<ConversationKey, PendingIMPermission>,
}

impl PendingPermissionTable {
    /// Install (or replace) the pending confirmation for a conversation.
    pub fn install(&mut self, pending: PendingIMPermission) {
        self.by_conversation.insert(pending.conversation_key.clone(), pending);
    }

    /// Look up the pending confirmation for a conversation, if any.
    #[must_use]
    pub fn get(&self, key: &ConversationKey) -> Option<&PendingIMPermission> {
        self.by_conversation.get(key)
    }

    /// Remove the pending confirmation for a conversation.
    pub fn clear(&mut self, key: &ConversationKey) -> Option<PendingIMPermission> {
        self.by_conversation.remove(key)
    }

    /// Whether the pending confirmation for `key` has exceeded the 60 s
    /// timeout.
    #[must_use]
    pub fn is_expired(&self, key: &ConversationKey) -> bool {
        self.by_conversation
            .get(key)
            .is_some_and(|pending| Utc::now().signed_duration_since(pending.created_at).to_std().unwrap_or_default() >= CONFIRMATION_TIMEOUT)
    }
}

/// Select the allow option for an `AskUserQuestion` answer: the option
/// whose label contains the canonical allow label, falling back to the
/// first option (§4.1 step 5).
#[must_use]
pub fn select_allow_option<'a>(options: &'a [String], canonical_allow_label: &str) -> Option<&'a str> {
    options
        .iter()
        .find(|opt| opt.contains(canonical_allow_label))
        .or_else(|| options.first())
        .map(String::as_str)
}

/// Synthesize `updatedInput.answers` for an `AskUserQuestion` allow by
/// selecting the canonical allow option for every question in the tool
/// input.
#[must_use]
pub fn synthesize_answers(tool_input: &serde_json::Value, canonical_allow_label: &str) -> serde_json::Value {
    let questions = tool_input.get("questions").and_then(serde_json::Value::as_array);
    let Some(questions) = questions else {
        return serde_json::json!({ "answers": [] });
    };

    let answers: Vec<serde_json::Value> = questions
        .iter()
        .map(|question| {
            let text = question
                .get("question")
                .or_else(|| question.get("text"))
                .and_then(serde_json::Value::as_str)
                .unwrap_or_default();
            let options: Vec<String> = question
                .get("options")
                .and_then(serde_json::Value::as_array)
                .map(|opts| {
                    opts.iter()
                        .filter_map(|o| o.as_str().map(str::to_owned))
                        .collect()
                })
                .unwrap_or_default();
            let answer = select_allow_option(&options, canonical_allow_label).unwrap_or_default();
            serde_json::json!({ "question": text, "answer": answer })
        })
        .collect();

    serde_json::json!({ "answers": answers })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_strips_trailing_punctuation_and_whitespace() {
        assert_eq!(normalize("  yes!  "), "yes");
        assert_eq!(normalize("允许。"), "允许");
    }

    #[test]
    fn classify_matches_allow_and_deny_sets_case_insensitively() {
        assert_eq!(classify("YES"), ConfirmationMatch::Allow);
        assert_eq!(classify("y"), ConfirmationMatch::Allow);
        assert_eq!(classify("同意"), ConfirmationMatch::Allow);
        assert_eq!(classify("No"), ConfirmationMatch::Deny);
        assert_eq!(classify("拒绝"), ConfirmationMatch::Deny);
        assert_eq!(classify(""), ConfirmationMatch::Empty);
        assert_eq!(classify("maybe later"), ConfirmationMatch::Unrecognized);
    }

    #[test]
    fn classify_is_anchored_not_substring() {
        // "yesterday" contains "yes" but must not match as an allow.
        assert_eq!(classify("yesterday"), ConfirmationMatch::Unrecognized);
    }

    #[test]
    fn select_allow_option_prefers_label_containing_canonical_text() {
        let options = vec!["拒绝本次操作".to_owned(), "允许本次操作".to_owned()];
        assert_eq!(select_allow_option(&options, "允许"), Some("允许本次操作"));
    }

    #[test]
    fn select_allow_option_falls_back_to_first_when_no_match() {
        let options = vec!["Option A".to_owned(), "Option B".to_owned()];
        assert_eq!(select_allow_option(&options, "允许"), Some("Option A"));
    }

    #[test]
    fn synthesize_answers_builds_one_answer_per_question() {
        let input = serde_json::json!({
            "questions": [
                { "question": "Deploy now?", "options": ["拒绝本次操作", "允许本次操作"] }
            ]
        });
        let result = synthesize_answers(&input, "允许");
        assert_eq!(result["answers"][0]["answer"], "允许本次操作");
    }
}
