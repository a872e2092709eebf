use serde::{Deserialize, Serialize};
use serde_json::Value;

use steward_types::ChatMessage;

/// Per-message framing overhead added on top of content tokens.
pub const MESSAGE_FRAMING_TOKENS: u64 = 6;

const CHARS_PER_TOKEN: f64 = 3.6;

/// Heuristic token count for plain text.
pub fn estimate_text_tokens(text: &str) -> u64 {
    if text.is_empty() {
        return 0;
    }
    ((text.len() as f64) / CHARS_PER_TOKEN).ceil().max(1.0) as u64
}

/// Token count for an arbitrary payload, serialized compactly first.
pub fn estimate_payload_tokens(payload: &Value) -> u64 {
    match payload {
        Value::String(text) => estimate_text_tokens(text),
        other => estimate_text_tokens(&other.to_string()),
    }
}

/// Token count for an assembled message list, framing included.
pub fn estimate_messages_tokens(messages: &[ChatMessage]) -> u64 {
    messages
        .iter()
        .map(|message| {
            let serialized = serde_json::to_value(message).unwrap_or(Value::Null);
            MESSAGE_FRAMING_TOKENS + estimate_payload_tokens(&serialized)
        })
        .sum()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum FillLevel {
    Ok,
    Medium,
    High,
    Critical,
}

/// Context budget snapshot for one assembly pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenBudget {
    pub input_tokens: u64,
    pub max_context_tokens: u64,
    pub reserved_output_tokens: u64,
    pub available_for_input: u64,
    pub remaining_input_tokens: u64,
    pub fill_ratio: f64,
    pub fill_level: FillLevel,
    pub within_budget: bool,
}

/// Compute the input budget for a model window.
///
/// `max_context_tokens` must be positive; the reserved output slice is
/// subtracted before comparing against the input estimate.
pub fn compute_budget(
    input_tokens: u64,
    max_context_tokens: u64,
    reserved_output_tokens: u64,
) -> TokenBudget {
    let max_context = max_context_tokens.max(1);
    let available_for_input = max_context.saturating_sub(reserved_output_tokens);
    let remaining_input_tokens = available_for_input.saturating_sub(input_tokens);
    let fill_ratio = input_tokens as f64 / max_context as f64;

    let fill_level = if fill_ratio >= 0.95 {
        FillLevel::Critical
    } else if fill_ratio >= 0.85 {
        FillLevel::High
    } else if fill_ratio >= 0.70 {
        FillLevel::Medium
    } else {
        FillLevel::Ok
    };

    TokenBudget {
        input_tokens,
        max_context_tokens: max_context,
        reserved_output_tokens,
        available_for_input,
        remaining_input_tokens,
        fill_ratio,
        fill_level,
        within_budget: input_tokens <= available_for_input,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn text_estimate_is_ceiling_of_len_over_heuristic() {
        assert_eq!(estimate_text_tokens(""), 0);
        assert_eq!(estimate_text_tokens("abc"), 1);
        // 36 chars / 3.6 = 10 tokens exactly
        assert_eq!(estimate_text_tokens(&"x".repeat(36)), 10);
        assert_eq!(estimate_text_tokens(&"x".repeat(37)), 11);
    }

    #[test]
    fn budget_levels_follow_fill_ratio() {
        assert_eq!(compute_budget(60, 100, 10).fill_level, FillLevel::Ok);
        assert_eq!(compute_budget(70, 100, 10).fill_level, FillLevel::Medium);
        assert_eq!(compute_budget(85, 100, 10).fill_level, FillLevel::High);
        assert_eq!(compute_budget(95, 100, 10).fill_level, FillLevel::Critical);
    }

    #[test]
    fn within_budget_respects_reserved_output() {
        let budget = compute_budget(90, 100, 10);
        assert!(budget.within_budget);
        assert_eq!(budget.remaining_input_tokens, 0);

        let over = compute_budget(91, 100, 10);
        assert!(!over.within_budget);
    }
}
