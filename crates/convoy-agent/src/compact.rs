//! History compaction.
//!
//! Once a conversation's recorded token usage crosses the configured
//! threshold, everything except the most recent `keep_recent` messages is
//! condensed by a cheap model into one summary message. System messages
//! stay in front; the summary goes right after them.

use std::sync::Arc;

use convoy_core::config::CompactionConfig;
use convoy_core::types::now_millis;
use convoy_core::ConversationKey;
use convoy_history::types::{estimate_tokens, tokens_since_summary};
use convoy_history::{HistoryError, HistoryMessage, HistoryStore};
use dashmap::DashMap;
use serde::Serialize;
use tracing::{info, warn};

use crate::provider::{ChatRequest, LlmProvider, Message, ProviderError, Role};

const SUMMARY_SYSTEM_PROMPT: &str = concat!(
    "You condense conversations. Summarize the transcript below so the ",
    "conversation can continue without it: keep decisions, facts the user ",
    "stated, open tasks and any code or identifiers that were agreed on. ",
    "Write plain prose, no preamble."
);

#[derive(Debug, thiserror::Error)]
pub enum CompactionError {
    #[error("no summarization model configured")]
    Unavailable,

    #[error("summarization failed: {0}")]
    Provider(#[from] ProviderError),

    #[error("summarization returned no text")]
    EmptySummary,

    #[error(transparent)]
    History(#[from] HistoryError),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionResult {
    pub compacted: bool,
    pub messages_before: usize,
    pub messages_after: usize,
    pub tokens_saved: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compacted_at: Option<i64>,
    /// Why nothing happened, when `compacted` is false.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl CompactionResult {
    fn skipped(count: usize, reason: &str) -> Self {
        Self {
            compacted: false,
            messages_before: count,
            messages_after: count,
            tokens_saved: 0,
            compacted_at: None,
            reason: Some(reason.to_string()),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CompactionStatus {
    pub in_progress: bool,
    pub last_result: Option<CompactionResult>,
}

pub struct CompactionService {
    history: Arc<HistoryStore>,
    provider: Option<Arc<dyn LlmProvider>>,
    config: CompactionConfig,
    status: DashMap<ConversationKey, CompactionStatus>,
}

/// Clears the in-progress flag however `compact` exits.
struct InProgress<'a> {
    status: &'a DashMap<ConversationKey, CompactionStatus>,
    key: ConversationKey,
}

impl Drop for InProgress<'_> {
    fn drop(&mut self) {
        if let Some(mut s) = self.status.get_mut(&self.key) {
            s.in_progress = false;
        }
    }
}

impl CompactionService {
    pub fn new(
        history: Arc<HistoryStore>,
        provider: Option<Arc<dyn LlmProvider>>,
        config: CompactionConfig,
    ) -> Self {
        Self {
            history,
            provider,
            config,
            status: DashMap::new(),
        }
    }

    pub fn config(&self) -> &CompactionConfig {
        &self.config
    }

    /// True once the token usage recorded since the last compaction reaches
    /// the threshold.
    pub async fn should_compact(&self, key: &ConversationKey) -> Result<bool, CompactionError> {
        let messages = self.history.get(key).await?;
        Ok(tokens_since_summary(&messages) >= self.config.threshold_tokens)
    }

    pub fn status(&self, key: &ConversationKey) -> CompactionStatus {
        self.status
            .get(key)
            .map(|s| s.clone())
            .unwrap_or_default()
    }

    pub fn is_running(&self, key: &ConversationKey) -> bool {
        self.status.get(key).is_some_and(|s| s.in_progress)
    }

    /// Compact `messages` (the conversation's current history) and store the result.
    /// `messages` must be a prefix of what the store holds for `key`.
    ///
    /// A no-op when another compaction of the same conversation is running, or
    /// when nothing older than the kept window is left to summarize. Earlier
    /// summaries are folded into the new one rather than counted as content.
    pub async fn compact(
        &self,
        key: &ConversationKey,
        messages: Vec<HistoryMessage>,
    ) -> Result<CompactionResult, CompactionError> {
        let before = messages.len();

        {
            let mut entry = self.status.entry(key.clone()).or_default();
            if entry.in_progress {
                return Ok(CompactionResult::skipped(before, "compaction already running"));
            }
            entry.in_progress = true;
        }
        let _guard = InProgress {
            status: &self.status,
            key: key.clone(),
        };

        let (system, body): (Vec<_>, Vec<_>) =
            messages.iter().cloned().partition(|m| m.is_system());
        let split = body.len().saturating_sub(self.config.keep_recent);
        let older = &body[..split];
        let recent = &body[split..];

        if !older.iter().any(|m| !m.summary) {
            let result = CompactionResult::skipped(before, "not enough history to compact");
            self.record(key, &result);
            return Ok(result);
        }

        let provider = self.provider.as_ref().ok_or(CompactionError::Unavailable)?;
        info!(
            conversation = %key,
            summarized = older.len(),
            kept = recent.len(),
            "compacting history"
        );

        let req = ChatRequest {
            model: self.config.model.clone(),
            system: SUMMARY_SYSTEM_PROMPT.to_string(),
            messages: vec![Message {
                role: Role::User,
                content: format!("Summarize this conversation:\n\n{}", transcript(older)),
            }],
            max_tokens: self.config.max_summary_tokens,
            stream: false,
            tools: Vec::new(),
            raw_messages: None,
        };
        let response = provider.send(&req).await.inspect_err(|e| {
            warn!(error = %e, conversation = %key, "compaction summary call failed");
        })?;

        let summary_text = response.content.trim();
        if summary_text.is_empty() {
            return Err(CompactionError::EmptySummary);
        }
        let summary = HistoryMessage::summary(summary_text);

        let tokens_saved =
            estimate_tokens(older).saturating_sub(estimate_tokens(std::slice::from_ref(&summary)));

        // Messages appended while the summary was produced are kept after the
        // recent window; any other change to the history abandons this pass.
        self.history.get(key).await?;
        let mut after = 0;
        let applied = self.history.modify(key, |current| {
            if current.len() < before || current[..before] != messages[..] {
                return false;
            }
            let appended = current.split_off(before);
            let mut compacted = system;
            compacted.push(summary);
            compacted.extend_from_slice(recent);
            compacted.extend(appended);
            after = compacted.len();
            *current = compacted;
            true
        });
        if !applied {
            let result = CompactionResult::skipped(before, "history changed during compaction");
            self.record(key, &result);
            return Ok(result);
        }

        let result = CompactionResult {
            compacted: true,
            messages_before: before,
            messages_after: after,
            tokens_saved,
            compacted_at: Some(now_millis()),
            reason: None,
        };
        info!(
            conversation = %key,
            before,
            after,
            tokens_saved,
            "history compacted"
        );
        self.record(key, &result);
        Ok(result)
    }

    fn record(&self, key: &ConversationKey, result: &CompactionResult) {
        if let Some(mut s) = self.status.get_mut(key) {
            s.last_result = Some(result.clone());
        }
    }
}

fn transcript(messages: &[HistoryMessage]) -> String {
    messages
        .iter()
        .map(|m| {
            if m.summary {
                format!("EARLIER SUMMARY: {}", m.content)
            } else {
                format!("{}: {}", m.role.to_string().to_uppercase(), m.content)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}
