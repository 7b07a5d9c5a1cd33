use convoy_core::{types::now_millis, TokenUsage};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::System => write!(f, "system"),
            Self::User => write!(f, "user"),
            Self::Assistant => write!(f, "assistant"),
            Self::Tool => write!(f, "tool"),
        }
    }
}

/// One entry of a conversation's durable history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HistoryMessage {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: Role,
    pub content: String,
    #[serde(default)]
    pub created_at: i64,
    /// Completion marker. An assistant entry without one was cut off mid-stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<i64>,
    /// Millis between generation start and the first emitted fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_duration: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token_usage: Option<TokenUsage>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub aborted: bool,
    /// Set on the single message that replaces compacted history.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub summary: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
}

impl HistoryMessage {
    fn base(role: Role, content: impl Into<String>) -> Self {
        Self {
            id: Some(uuid::Uuid::now_v7().to_string()),
            role,
            content: content.into(),
            created_at: now_millis(),
            completed_at: None,
            thinking_duration: None,
            token_usage: None,
            aborted: false,
            summary: false,
            tool_call_id: None,
            tool_name: None,
        }
    }

    pub fn system(content: impl Into<String>) -> Self {
        Self::base(Role::System, content)
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::base(Role::User, content)
    }

    /// An assistant entry with no completion marker (still streaming, or cut off).
    pub fn assistant(content: impl Into<String>) -> Self {
        Self::base(Role::Assistant, content)
    }

    /// A finished assistant response.
    pub fn assistant_completed(
        id: impl Into<String>,
        content: impl Into<String>,
        completed_at: i64,
        thinking_duration: Option<u64>,
        token_usage: Option<TokenUsage>,
    ) -> Self {
        Self {
            id: Some(id.into()),
            completed_at: Some(completed_at),
            thinking_duration,
            token_usage,
            ..Self::base(Role::Assistant, content)
        }
    }

    /// Partial output kept after the user stopped the generation.
    pub fn assistant_aborted(id: impl Into<String>, content: impl Into<String>) -> Self {
        Self {
            id: Some(id.into()),
            aborted: true,
            ..Self::base(Role::Assistant, content)
        }
    }

    pub fn tool_result(
        call_id: impl Into<String>,
        tool_name: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        Self {
            tool_call_id: Some(call_id.into()),
            tool_name: Some(tool_name.into()),
            ..Self::base(Role::Tool, content)
        }
    }

    /// Condensed replacement for compacted history.
    pub fn summary(content: impl Into<String>) -> Self {
        Self {
            summary: true,
            completed_at: Some(now_millis()),
            ..Self::base(Role::Assistant, content)
        }
    }

    pub fn with_token_usage(mut self, usage: TokenUsage) -> Self {
        self.token_usage = Some(usage);
        self
    }

    pub fn is_system(&self) -> bool {
        self.role == Role::System
    }

    /// An assistant entry that was interrupted without being flagged aborted:
    /// the client never saw its completion and must be sent one on attach.
    pub fn looks_incomplete(&self) -> bool {
        self.role == Role::Assistant
            && self.completed_at.is_none()
            && !self.content.is_empty()
            && !self.aborted
    }
}

/// Sum of recorded token usage across a history.
pub fn cumulative_tokens(messages: &[HistoryMessage]) -> u64 {
    messages
        .iter()
        .filter_map(|m| m.token_usage)
        .map(|u| u.total())
        .sum()
}

/// Recorded token usage of messages created after the latest summary.
///
/// Messages a compaction kept predate its summary, so their usage is not
/// counted again. Without a summary this is [`cumulative_tokens`].
pub fn tokens_since_summary(messages: &[HistoryMessage]) -> u64 {
    let Some(summary) = messages.iter().rev().find(|m| m.summary) else {
        return cumulative_tokens(messages);
    };
    messages
        .iter()
        .filter(|m| !m.summary && m.created_at > summary.created_at)
        .filter_map(|m| m.token_usage)
        .map(|u| u.total())
        .sum()
}

/// Rough token estimate (≈4 chars per token) for content without recorded usage.
pub fn estimate_tokens(messages: &[HistoryMessage]) -> u64 {
    messages
        .iter()
        .map(|m| (m.content.chars().count() as u64).div_ceil(4))
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn incomplete_detection() {
        assert!(HistoryMessage::assistant("partial").looks_incomplete());
        assert!(!HistoryMessage::assistant("").looks_incomplete());
        assert!(!HistoryMessage::assistant_aborted("g1", "partial").looks_incomplete());
        assert!(!HistoryMessage::assistant_completed("g1", "done", 1, None, None).looks_incomplete());
        assert!(!HistoryMessage::user("hi").looks_incomplete());
    }

    #[test]
    fn cumulative_tokens_ignores_unrecorded() {
        let msgs = vec![
            HistoryMessage::user("hello"),
            HistoryMessage::assistant_completed(
                "a",
                "hi",
                1,
                None,
                Some(TokenUsage { input_tokens: 100, output_tokens: 20 }),
            ),
            HistoryMessage::assistant_completed(
                "b",
                "hi",
                2,
                None,
                Some(TokenUsage { input_tokens: 5, output_tokens: 5 }),
            ),
        ];
        assert_eq!(cumulative_tokens(&msgs), 130);
    }

    #[test]
    fn usage_kept_through_compaction_is_not_recounted() {
        let usage = TokenUsage { input_tokens: 1_000, output_tokens: 0 };
        let kept = HistoryMessage::assistant_completed("k", "kept", 1, None, Some(usage));
        let mut summary = HistoryMessage::summary("earlier");
        summary.created_at = kept.created_at + 10;
        let mut later = HistoryMessage::assistant_completed("n", "new", 2, None, Some(usage));
        later.created_at = summary.created_at + 10;

        let msgs = vec![summary.clone(), kept.clone()];
        assert_eq!(cumulative_tokens(&msgs), 1_000);
        assert_eq!(tokens_since_summary(&msgs), 0);

        let msgs = vec![summary, kept.clone(), later];
        assert_eq!(tokens_since_summary(&msgs), 1_000);
        assert_eq!(tokens_since_summary(&[kept]), 1_000);
    }

    #[test]
    fn flags_are_omitted_from_json_when_false() {
        let json = serde_json::to_string(&HistoryMessage::user("x")).unwrap();
        assert!(!json.contains("aborted"));
        assert!(!json.contains("summary"));
        let json = serde_json::to_string(&HistoryMessage::assistant_aborted("g", "x")).unwrap();
        assert!(json.contains(r#""aborted":true"#));
    }
}
