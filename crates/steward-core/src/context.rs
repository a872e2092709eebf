use serde::{Deserialize, Serialize};
use serde_json::Value;

use steward_types::{ChatMessage, SessionEventType};

use crate::tokens::{compute_budget, estimate_messages_tokens, TokenBudget};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ContextPriority {
    Base,
    Supplemental,
    Fact,
}

/// One tagged context item, keyed by `source_id` (`base:*`, `supplemental:*`,
/// `fact:*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextItem {
    pub source_id: String,
    pub content: String,
    pub priority: ContextPriority,
    pub label: String,
}

/// Ordered set of context items keyed by source id. Upsert keeps the
/// original insertion position.
#[derive(Debug, Clone, Default)]
pub struct ContextState {
    items: Vec<ContextItem>,
}

impl ContextState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_item(
        &mut self,
        source_id: impl Into<String>,
        content: impl Into<String>,
        priority: ContextPriority,
        label: impl Into<String>,
    ) {
        let source_id = source_id.into();
        let content = content.into();
        let label = label.into();
        if let Some(existing) = self.items.iter_mut().find(|item| item.source_id == source_id) {
            existing.content = content;
            existing.priority = priority;
            existing.label = label;
            return;
        }
        self.items.push(ContextItem {
            source_id,
            content,
            priority,
            label,
        });
    }

    pub fn upsert_base(&mut self, path: &str, content: impl Into<String>) {
        self.upsert_item(
            format!("base:{path}"),
            content,
            ContextPriority::Base,
            format!("BaseContext:{path}"),
        );
    }

    pub fn upsert_supplemental(&mut self, path: &str, content: impl Into<String>) {
        self.upsert_item(
            format!("supplemental:{path}"),
            content,
            ContextPriority::Supplemental,
            format!("SupplementalContext:{path}"),
        );
    }

    pub fn upsert_fact(&mut self, key: &str, content: impl Into<String>) {
        self.upsert_item(
            format!("fact:{key}"),
            content,
            ContextPriority::Fact,
            format!("Fact:{key}"),
        );
    }

    pub fn remove(&mut self, source_id: &str) {
        self.items.retain(|item| item.source_id != source_id);
    }

    pub fn all_items(&self) -> &[ContextItem] {
        &self.items
    }

    pub fn facts(&self) -> impl Iterator<Item = (&str, &str)> {
        self.items
            .iter()
            .filter(|item| item.priority == ContextPriority::Fact)
            .map(|item| {
                let key = item.source_id.strip_prefix("fact:").unwrap_or(&item.source_id);
                (key, item.content.as_str())
            })
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// One entry in the recent dialog window handed to assembly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TurnEvent {
    pub event_type: SessionEventType,
    pub payload: Value,
}

impl TurnEvent {
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            event_type: SessionEventType::UserMessage,
            payload: serde_json::json!({"text": text.into()}),
        }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self {
            event_type: SessionEventType::AssistantMessage,
            payload: serde_json::json!({"text": text.into()}),
        }
    }

    pub fn system(payload: Value) -> Self {
        Self {
            event_type: SessionEventType::System,
            payload,
        }
    }
}

fn event_to_message(event: &TurnEvent) -> Option<ChatMessage> {
    match event.event_type {
        SessionEventType::UserMessage => event
            .payload
            .get("text")
            .and_then(Value::as_str)
            .map(ChatMessage::user),
        SessionEventType::AssistantMessage => event
            .payload
            .get("text")
            .and_then(Value::as_str)
            .map(ChatMessage::assistant),
        SessionEventType::ToolResult => Some(ChatMessage::assistant(format!(
            "Tool result: {}",
            event.payload
        ))),
        SessionEventType::WorkerComplete => Some(ChatMessage::assistant(format!(
            "Worker result: {}",
            event.payload
        ))),
        SessionEventType::System => Some(ChatMessage::system(format!(
            "[SystemEvent]\n{}",
            event.payload
        ))),
        SessionEventType::ToolCall | SessionEventType::WorkerSpawn => None,
    }
}

fn event_digest(event: &TurnEvent) -> String {
    let (role, text) = match event_to_message(event) {
        Some(message) => (message.role, message.content),
        None => ("event".to_string(), event.payload.to_string()),
    };
    let mut trimmed: String = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if trimmed.chars().count() > 120 {
        trimmed = trimmed.chars().take(120).collect();
        trimmed.push('…');
    }
    format!("{role}: {trimmed}")
}

#[derive(Debug, Clone, Copy)]
pub struct TokenLimits {
    pub max_context_tokens: u64,
    pub reserved_output_tokens: u64,
}

/// Result of one assembly pass.
#[derive(Debug, Clone)]
pub struct AssembledMessages {
    pub messages: Vec<ChatMessage>,
    pub token_estimate: u64,
    pub budget: Option<TokenBudget>,
    pub removed_fact_items: usize,
    pub removed_supplemental_items: usize,
    pub dropped_recent_events: usize,
    pub kept_recent_message_count: usize,
    pub kept_context_source_ids: Vec<String>,
    pub updated_session_summary: Option<String>,
}

impl AssembledMessages {
    pub fn within_budget(&self) -> bool {
        self.budget.as_ref().map(|b| b.within_budget).unwrap_or(true)
    }
}

/// Build the ordered message list: base context sorted by path, the rolling
/// session summary, supplemental context sorted by path, facts, then the
/// recent dialog. Under budget pressure items drop strictly by priority
/// (facts, then supplemental, both newest-path-first), after which the
/// oldest recent events are folded into the session summary.
pub fn assemble_messages(
    context: &ContextState,
    recent_events: &[TurnEvent],
    session_summary: Option<&str>,
    limits: Option<TokenLimits>,
) -> AssembledMessages {
    let mut base: Vec<&ContextItem> = Vec::new();
    let mut supplemental: Vec<&ContextItem> = Vec::new();
    let mut facts: Vec<&ContextItem> = Vec::new();
    for item in context.all_items() {
        if item.content.trim().is_empty() {
            continue;
        }
        match item.priority {
            ContextPriority::Base => base.push(item),
            ContextPriority::Supplemental => supplemental.push(item),
            ContextPriority::Fact => facts.push(item),
        }
    }
    base.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    supplemental.sort_by(|a, b| a.source_id.cmp(&b.source_id));
    facts.sort_by(|a, b| a.source_id.cmp(&b.source_id));

    let mut summary: Option<String> = session_summary
        .map(str::trim)
        .filter(|text| !text.is_empty())
        .map(str::to_string);

    let mut kept_facts = facts.len();
    let mut kept_supplemental = supplemental.len();
    let mut events_start = 0usize;
    let mut compacted: Vec<String> = Vec::new();

    loop {
        let mut messages: Vec<ChatMessage> = Vec::new();
        for item in &base {
            messages.push(ChatMessage::system(format!(
                "[{}]\n{}",
                item.label, item.content
            )));
        }
        let effective_summary = match (&summary, compacted.is_empty()) {
            (Some(text), true) => Some(text.clone()),
            (Some(text), false) => Some(format!(
                "{text}\nCompactedHistory: {}",
                compacted.join(" | ")
            )),
            (None, false) => Some(format!("CompactedHistory: {}", compacted.join(" | "))),
            (None, true) => None,
        };
        if let Some(text) = &effective_summary {
            messages.push(ChatMessage::system(format!("[SessionSummary]\n{text}")));
        }
        for item in supplemental.iter().take(kept_supplemental) {
            messages.push(ChatMessage::system(format!(
                "[{}]\n{}",
                item.label, item.content
            )));
        }
        for item in facts.iter().take(kept_facts) {
            messages.push(ChatMessage::system(format!(
                "[{}]\n{}",
                item.label, item.content
            )));
        }
        let mut kept_recent = 0usize;
        for event in &recent_events[events_start..] {
            if let Some(message) = event_to_message(event) {
                messages.push(message);
                kept_recent += 1;
            }
        }

        let token_estimate = estimate_messages_tokens(&messages);
        let budget = limits.map(|limits| {
            compute_budget(
                token_estimate,
                limits.max_context_tokens,
                limits.reserved_output_tokens,
            )
        });

        let over_budget = budget
            .as_ref()
            .map(|budget| !budget.within_budget)
            .unwrap_or(false);
        if over_budget {
            if kept_facts > 0 {
                kept_facts -= 1;
                continue;
            }
            if kept_supplemental > 0 {
                kept_supplemental -= 1;
                continue;
            }
            if events_start + 1 < recent_events.len() {
                compacted.push(event_digest(&recent_events[events_start]));
                events_start += 1;
                continue;
            }
        }

        let mut kept_context_source_ids: Vec<String> = Vec::new();
        kept_context_source_ids.extend(base.iter().map(|item| item.source_id.clone()));
        kept_context_source_ids.extend(
            supplemental
                .iter()
                .take(kept_supplemental)
                .map(|item| item.source_id.clone()),
        );
        kept_context_source_ids.extend(
            facts
                .iter()
                .take(kept_facts)
                .map(|item| item.source_id.clone()),
        );

        return AssembledMessages {
            messages,
            token_estimate,
            budget,
            removed_fact_items: facts.len() - kept_facts,
            removed_supplemental_items: supplemental.len() - kept_supplemental,
            dropped_recent_events: events_start,
            kept_recent_message_count: kept_recent,
            kept_context_source_ids,
            updated_session_summary: effective_summary,
        };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state_with(base: usize, supplemental: usize, facts: usize, size: usize) -> ContextState {
        let mut state = ContextState::new();
        for idx in 0..base {
            state.upsert_base(&format!("context/base_{idx}.md"), "b".repeat(size));
        }
        for idx in 0..supplemental {
            state.upsert_supplemental(&format!("context/supp_{idx}.md"), "s".repeat(size));
        }
        for idx in 0..facts {
            state.upsert_fact(&format!("fact_{idx}"), "f".repeat(size));
        }
        state
    }

    #[test]
    fn ordering_is_base_summary_supplemental_facts_dialog() {
        let state = state_with(2, 1, 1, 10);
        let events = vec![TurnEvent::user("hello")];
        let assembled = assemble_messages(&state, &events, Some("summary so far"), None);

        let roles: Vec<&str> = assembled
            .messages
            .iter()
            .map(|m| m.role.as_str())
            .collect();
        assert_eq!(roles, vec!["system", "system", "system", "system", "system", "user"]);
        assert!(assembled.messages[0].content.starts_with("[BaseContext:"));
        assert!(assembled.messages[2].content.starts_with("[SessionSummary]"));
        assert!(assembled.messages[3]
            .content
            .starts_with("[SupplementalContext:"));
        assert!(assembled.messages[4].content.starts_with("[Fact:"));
    }

    #[test]
    fn upsert_replaces_in_place() {
        let mut state = ContextState::new();
        state.upsert_fact("name", "old");
        state.upsert_fact("name", "new");
        assert_eq!(state.all_items().len(), 1);
        assert_eq!(state.all_items()[0].content, "new");
    }

    #[test]
    fn barely_over_budget_drops_exactly_one_optional_item() {
        let state = state_with(1, 2, 0, 40);
        let events = vec![TurnEvent::user("hi")];

        // Generous budget: nothing dropped.
        let roomy = assemble_messages(
            &state,
            &events,
            None,
            Some(TokenLimits {
                max_context_tokens: 10_000,
                reserved_output_tokens: 100,
            }),
        );
        assert_eq!(roomy.removed_supplemental_items, 0);
        assert!(roomy.within_budget());

        // Budget set just below the full estimate: exactly one drop.
        let full_estimate = roomy.token_estimate;
        let tight = assemble_messages(
            &state,
            &events,
            None,
            Some(TokenLimits {
                max_context_tokens: full_estimate - 1,
                reserved_output_tokens: 0,
            }),
        );
        assert_eq!(tight.removed_supplemental_items, 1);
        assert!(tight.within_budget());
    }

    #[test]
    fn facts_drop_before_supplemental() {
        let state = state_with(0, 1, 1, 60);
        let events = vec![TurnEvent::user("hi")];
        let roomy = assemble_messages(&state, &events, None, None);
        let tight = assemble_messages(
            &state,
            &events,
            None,
            Some(TokenLimits {
                max_context_tokens: roomy.token_estimate - 1,
                reserved_output_tokens: 0,
            }),
        );
        assert_eq!(tight.removed_fact_items, 1);
        assert_eq!(tight.removed_supplemental_items, 0);
    }

    #[test]
    fn dropped_events_fold_into_session_summary() {
        let state = state_with(0, 0, 0, 0);
        let events: Vec<TurnEvent> = (0..6)
            .map(|idx| TurnEvent::user(format!("message number {idx} {}", "x".repeat(200))))
            .collect();

        let assembled = assemble_messages(
            &state,
            &events,
            None,
            Some(TokenLimits {
                max_context_tokens: 250,
                reserved_output_tokens: 10,
            }),
        );
        assert!(assembled.dropped_recent_events > 0);
        let summary = assembled.updated_session_summary.unwrap();
        assert!(summary.contains("CompactedHistory:"));
        assert!(summary.contains("message number 0"));
        // The newest event is always kept.
        assert!(assembled.kept_recent_message_count >= 1);
    }
}
