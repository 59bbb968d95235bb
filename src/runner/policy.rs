//! Tool-safety gate: the synchronous policy check run before every tool
//! use (§4.2 table).
//!
//! Grounded on the teacher's `policy::evaluator::PolicyEvaluator` — same
//! "match an ordered rule table, return an allow/deny verdict" shape —
//! retargeted from workspace-configurable auto-approve glob/regex rules
//! to the spec's fixed, non-configurable safety table.

use regex::Regex;
use serde_json::Value;
use tracing::{info, info_span};

use crate::models::permission::PermissionResult;

/// Plain-chat vs agent-driven-question confirmation style (Glossary).
/// The IM gateway always operates in [`ConfirmationMode::Text`]; `Modal`
/// is retained only to document the upstream SDK's other mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationMode {
    /// Plain allow/deny chat confirmation (always used by IM conversations).
    Text,
    /// Agent-driven question UI (not reachable from an IM conversation).
    Modal,
}

/// Canonical label used to synthesize the allow option on a delete gate,
/// and to recognize the operator's chosen label on resolution.
pub const ALLOW_ONCE_LABEL: &str = "允许本次操作";
/// Canonical label for the deny option on a synthesized delete gate.
pub const DENY_ONCE_LABEL: &str = "拒绝本次操作";

/// Outcome of evaluating a tool invocation against the safety table.
#[derive(Debug, Clone)]
pub enum ToolGate {
    /// Tool use proceeds unchanged.
    Allow,
    /// Tool use is denied outright; no human round-trip needed.
    Deny(PermissionResult),
    /// Tool use requires an explicit human decision before proceeding.
    RequireApproval {
        /// Human-readable question surfaced to the operator.
        question: String,
        /// Two-option choice: `[allow, deny]`.
        options: [String; 2],
    },
}

/// Evaluate `tool_name`/`tool_input` against the ordered safety table.
///
/// Evaluation order (first match wins), per §4.2:
/// 1. `WebSearch`/`WebFetch` (any case/separator) → deny.
/// 2. `AskUserQuestion` → require approval; allow requires `answers`.
/// 3. A delete-shaped invocation on any other tool → require approval.
/// 4. `auto_approve` → short-circuit allow.
/// 5. Otherwise → allow.
#[must_use]
pub fn evaluate(tool_name: &str, tool_input: &Value, auto_approve: bool) -> ToolGate {
    let _span = info_span!("policy_evaluate", tool = %tool_name).entered();

    if is_blocked_builtin(tool_name) {
        info!(tool = %tool_name, "denying blocked built-in tool");
        return ToolGate::Deny(PermissionResult::deny(format!(
            "{tool_name} is not permitted by policy."
        )));
    }

    if is_ask_user_question(tool_name) {
        let question = extract_first_question(tool_input)
            .unwrap_or_else(|| "The agent needs your input to continue.".to_owned());
        return ToolGate::RequireApproval {
            question,
            options: [ALLOW_ONCE_LABEL.to_owned(), DENY_ONCE_LABEL.to_owned()],
        };
    }

    if let Some(command) = delete_shaped_command(tool_name, tool_input) {
        info!(tool = %tool_name, "delete-shaped invocation requires approval");
        let truncated: String = command.chars().take(120).collect();
        return ToolGate::RequireApproval {
            question: truncated,
            options: [ALLOW_ONCE_LABEL.to_owned(), DENY_ONCE_LABEL.to_owned()],
        };
    }

    if auto_approve {
        info!(tool = %tool_name, "auto-approve short-circuit allow");
        return ToolGate::Allow;
    }

    ToolGate::Allow
}

/// Decide whether an `AskUserQuestion` allow is well-formed: it must carry
/// `updatedInput.answers`.
#[must_use]
pub fn validate_ask_user_question_allow(updated_input: Option<&Value>) -> bool {
    updated_input
        .and_then(|v| v.get("answers"))
        .is_some_and(|answers| !answers.is_null())
}

/// Resolve a delete-gate decision by comparing the chosen label against
/// the canonical allow label.
#[must_use]
pub fn delete_gate_approved(chosen_label: &str) -> bool {
    chosen_label == ALLOW_ONCE_LABEL
}

fn is_blocked_builtin(tool_name: &str) -> bool {
    let normalized = normalize(tool_name);
    normalized == "websearch" || normalized == "webfetch"
}

fn is_ask_user_question(tool_name: &str) -> bool {
    normalize(tool_name) == "askuserquestion"
}

fn normalize(tool_name: &str) -> String {
    tool_name
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// Extract the first question's text for the confirmation prompt (§4.1).
fn extract_first_question(tool_input: &Value) -> Option<String> {
    tool_input
        .get("questions")
        .and_then(Value::as_array)
        .and_then(|qs| qs.first())
        .and_then(|q| q.get("question").or_else(|| q.get("text")))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

/// Shell-pattern for deletion commands (§4.2).
fn delete_command_regex() -> Regex {
    // Constructed fresh per call; evaluation is synchronous and
    // infrequent (one gate per tool use), so a static cache is not
    // worth the added complexity here.
    Regex::new(r"\b(rm|rmdir|unlink|del|erase|remove-item)\b|find .* -delete|git clean")
        .expect("delete-command pattern is a compile-time constant")
}

/// Whether this invocation is delete-shaped: either the tool name itself
/// names a delete operation, or (for shell-style tools) the command line
/// matches the delete regex.
fn delete_shaped_command(tool_name: &str, tool_input: &Value) -> Option<String> {
    let normalized = normalize(tool_name);
    if matches!(
        normalized.as_str(),
        "delete" | "remove" | "unlink" | "rmdir"
    ) {
        return Some(tool_name.to_owned());
    }

    let command = tool_input
        .get("command")
        .and_then(Value::as_str)
        .or_else(|| tool_input.get("cmd").and_then(Value::as_str))?;

    if delete_command_regex().is_match(command) {
        Some(command.to_owned())
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn web_search_is_denied_regardless_of_capitalization() {
        for name in ["WebSearch", "web_search", "WEBSEARCH", "web-fetch"] {
            let gate = evaluate(name, &json!({}), true);
            assert!(matches!(gate, ToolGate::Deny(_)), "{name} should be denied");
        }
    }

    #[test]
    fn delete_shaped_bash_requires_approval_even_with_auto_approve() {
        let input = json!({ "command": "rm -rf build/" });
        let gate = evaluate("Bash", &input, true);
        match gate {
            ToolGate::RequireApproval { question, options } => {
                assert!(question.contains("rm -rf build/"));
                assert_eq!(options[0], ALLOW_ONCE_LABEL);
            }
            other => panic!("expected RequireApproval, got {other:?}"),
        }
    }

    #[test]
    fn ordinary_tool_is_allowed() {
        let gate = evaluate("ReadFile", &json!({"path": "a.txt"}), false);
        assert!(matches!(gate, ToolGate::Allow));
    }

    #[test]
    fn auto_approve_short_circuits_non_delete_tools() {
        let gate = evaluate("RunTests", &json!({}), true);
        assert!(matches!(gate, ToolGate::Allow));
    }

    #[test]
    fn ask_user_question_surfaces_first_question_text() {
        let input = json!({ "questions": [{ "question": "Deploy to prod?" }] });
        let gate = evaluate("AskUserQuestion", &input, false);
        match gate {
            ToolGate::RequireApproval { question, .. } => assert_eq!(question, "Deploy to prod?"),
            other => panic!("expected RequireApproval, got {other:?}"),
        }
    }

    #[test]
    fn ask_user_question_answers_validation() {
        assert!(!validate_ask_user_question_allow(None));
        assert!(!validate_ask_user_question_allow(Some(&json!({}))));
        assert!(validate_ask_user_question_allow(Some(
            &json!({ "answers": [{"question": "q", "answer": "a"}] })
        )));
    }

    #[test]
    fn delete_gate_label_must_match_canonical_allow_label_exactly() {
        assert!(delete_gate_approved(ALLOW_ONCE_LABEL));
        assert!(!delete_gate_approved(DENY_ONCE_LABEL));
        assert!(!delete_gate_approved("允许"));
    }

    #[test]
    fn long_delete_command_is_truncated_to_120_chars() {
        let long_path = "a/".repeat(100);
        let input = json!({ "command": format!("rm -rf {long_path}") });
        let gate = evaluate("Bash", &input, false);
        match gate {
            ToolGate::RequireApproval { question, .. } => {
                assert!(question.chars().count() <= 120);
            }
            other => panic!("expected RequireApproval, got {other:?}"),
        }
    }
}
