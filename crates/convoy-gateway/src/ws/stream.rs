//! Streaming coordinator: the single source of truth for an in-flight
//! generation, and the single-flight guard per conversation.
//!
//! Everything that must be observed atomically with respect to a replay is
//! done inside the conversation's map entry: fragment fan-out, completion
//! fan-out, and connection attach all run while the entry is locked. A
//! connection attaching mid-stream therefore sees each fragment exactly once,
//! either inside the replayed buffer or as a live chunk.
//!
//! Closures passed to this type run under a map lock. They must not await
//! and must not call back into the coordinator.

use convoy_core::types::now_millis;
use convoy_core::{ConversationKey, GenerationId};
use convoy_protocol::LlmComplete;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct StreamState {
    pub key: ConversationKey,
    pub generation_id: GenerationId,
    pub fragments: Vec<String>,
    /// Concatenation of `fragments`.
    pub text: String,
    pub started_at: i64,
    pub first_fragment_at: Option<i64>,
    pub last_fragment_at: Option<i64>,
    /// Set once the final `llm_complete` has gone out; the state lingers
    /// only until the history write is issued.
    pub completion: Option<LlmComplete>,
    cancel: CancellationToken,
}

impl StreamState {
    /// The assistant message produced by this generation shares its id.
    pub fn message_id(&self) -> &str {
        self.generation_id.as_str()
    }

    /// Millis between generation start and the first emitted fragment.
    pub fn thinking_duration(&self) -> Option<u64> {
        self.first_fragment_at
            .map(|first| first.saturating_sub(self.started_at).max(0) as u64)
    }
}

#[derive(Default)]
pub struct StreamingCoordinator {
    streams: DashMap<ConversationKey, StreamState>,
}

impl StreamingCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the conversation for a new generation. Returns `None` (and
    /// changes nothing) when one is already running.
    pub fn start_generation(
        &self,
        key: &ConversationKey,
    ) -> Option<(GenerationId, CancellationToken)> {
        match self.streams.entry(key.clone()) {
            Entry::Occupied(existing) => {
                warn!(
                    conversation = %key,
                    active = %existing.get().generation_id,
                    "generation already active, ignoring start"
                );
                None
            }
            Entry::Vacant(slot) => {
                let generation_id = GenerationId::new();
                let cancel = CancellationToken::new();
                slot.insert(StreamState {
                    key: key.clone(),
                    generation_id: generation_id.clone(),
                    fragments: Vec::new(),
                    text: String::new(),
                    started_at: now_millis(),
                    first_fragment_at: None,
                    last_fragment_at: None,
                    completion: None,
                    cancel: cancel.clone(),
                });
                debug!(conversation = %key, generation = %generation_id, "generation started");
                Some((generation_id, cancel))
            }
        }
    }

    /// Append one fragment, then run `publish` before the entry is released.
    /// Returns false if `generation_id` is not the active generation.
    pub fn append_fragment(
        &self,
        key: &ConversationKey,
        generation_id: &GenerationId,
        text: &str,
        publish: impl FnOnce(&StreamState),
    ) -> bool {
        let Some(mut state) = self.streams.get_mut(key) else {
            return false;
        };
        if state.generation_id != *generation_id {
            return false;
        }
        let now = now_millis();
        if state.first_fragment_at.is_none() {
            state.first_fragment_at = Some(now);
        }
        state.last_fragment_at = Some(now);
        state.fragments.push(text.to_string());
        state.text.push_str(text);
        publish(&state);
        true
    }

    /// Record the final completion and publish it under the entry lock.
    pub fn finish(
        &self,
        key: &ConversationKey,
        generation_id: &GenerationId,
        completion: LlmComplete,
        publish: impl FnOnce(&StreamState),
    ) -> bool {
        let Some(mut state) = self.streams.get_mut(key) else {
            return false;
        };
        if state.generation_id != *generation_id {
            return false;
        }
        state.completion = Some(completion);
        publish(&state);
        true
    }

    /// Drop the state. Only the generation that owns it can remove it, so a
    /// late cleanup never clobbers a newer generation.
    pub fn complete_generation(
        &self,
        key: &ConversationKey,
        generation_id: &GenerationId,
    ) -> Option<StreamState> {
        self.streams
            .remove_if(key, |_, s| s.generation_id == *generation_id)
            .map(|(_, s)| s)
    }

    /// Signal the active generation to stop. Returns false if none is running.
    pub fn abort(&self, key: &ConversationKey) -> bool {
        match self.streams.get(key) {
            Some(state) => {
                state.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Signal every active generation to stop. Returns how many were running.
    pub fn abort_all(&self) -> usize {
        self.streams
            .iter()
            .inspect(|state| state.cancel.cancel())
            .count()
    }

    /// Run `f` with the active stream (if any) while holding the entry lock.
    pub fn attach<R>(&self, key: &ConversationKey, f: impl FnOnce(Option<&StreamState>) -> R) -> R {
        match self.streams.entry(key.clone()) {
            Entry::Occupied(active) => f(Some(active.get())),
            Entry::Vacant(slot) => {
                let out = f(None);
                drop(slot);
                out
            }
        }
    }

    pub fn snapshot_for(&self, key: &ConversationKey) -> Vec<StreamState> {
        self.streams
            .get(key)
            .map(|s| vec![s.clone()])
            .unwrap_or_default()
    }

    pub fn is_active(&self, key: &ConversationKey) -> bool {
        self.streams.contains_key(key)
    }

    pub fn active_count(&self) -> usize {
        self.streams.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key() -> ConversationKey {
        ConversationKey::new("p1", "c1")
    }

    #[test]
    fn single_flight_per_conversation() {
        let coord = StreamingCoordinator::new();
        let (gen, _) = coord.start_generation(&key()).unwrap();
        assert!(coord.start_generation(&key()).is_none());
        assert_eq!(coord.snapshot_for(&key()).len(), 1);
        assert_eq!(coord.snapshot_for(&key())[0].generation_id, gen);

        // Other conversations are independent.
        assert!(coord
            .start_generation(&ConversationKey::new("p1", "c2"))
            .is_some());

        coord.complete_generation(&key(), &gen).unwrap();
        let (next, _) = coord.start_generation(&key()).unwrap();
        assert_ne!(next, gen);
    }

    #[test]
    fn fragments_accumulate_in_order() {
        let coord = StreamingCoordinator::new();
        let (gen, _) = coord.start_generation(&key()).unwrap();
        let mut published = Vec::new();
        for piece in ["", "Hel", "lo"] {
            assert!(coord.append_fragment(&key(), &gen, piece, |s| {
                published.push(s.text.clone())
            }));
        }
        let state = &coord.snapshot_for(&key())[0];
        assert_eq!(state.text, "Hello");
        assert_eq!(state.fragments.len(), 3);
        assert_eq!(published, vec!["", "Hel", "Hello"]);
        assert!(state.first_fragment_at.is_some());
        assert!(state.thinking_duration().is_some());
    }

    #[test]
    fn stale_generation_cannot_touch_state() {
        let coord = StreamingCoordinator::new();
        let (gen, _) = coord.start_generation(&key()).unwrap();
        let stale = GenerationId::new();

        assert!(!coord.append_fragment(&key(), &stale, "x", |_| panic!("published")));
        assert!(coord.complete_generation(&key(), &stale).is_none());
        assert!(coord.is_active(&key()));
        assert!(coord.complete_generation(&key(), &gen).is_some());
        assert!(!coord.is_active(&key()));
    }

    #[test]
    fn attach_sees_start_time_before_any_fragment() {
        let coord = StreamingCoordinator::new();
        coord.start_generation(&key()).unwrap();
        let seen = coord.attach(&key(), |s| s.map(|s| (s.started_at, s.text.clone())));
        let (started_at, text) = seen.unwrap();
        assert!(started_at > 0);
        assert!(text.is_empty());
        assert!(coord.attach(&ConversationKey::new("p1", "idle"), |s| s.is_none()));
    }

    #[test]
    fn abort_cancels_the_token() {
        let coord = StreamingCoordinator::new();
        assert!(!coord.abort(&key()));
        let (_, cancel) = coord.start_generation(&key()).unwrap();
        assert!(coord.abort(&key()));
        assert!(cancel.is_cancelled());
    }

    #[test]
    fn abort_all_cancels_every_conversation() {
        let coord = StreamingCoordinator::new();
        assert_eq!(coord.abort_all(), 0);
        let (_, first) = coord.start_generation(&key()).unwrap();
        let (_, second) = coord
            .start_generation(&ConversationKey::new("p2", "c1"))
            .unwrap();
        assert_eq!(coord.abort_all(), 2);
        assert!(first.is_cancelled());
        assert!(second.is_cancelled());
    }
}
