use convoy_core::types::now_millis;
use convoy_core::{ConversationKey, SessionId};
use dashmap::DashMap;
use serde::Serialize;

/// Logical chat session; one per connection, outliving nothing but its socket.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub session_id: SessionId,
    pub conversation_id: String,
    pub project_id: String,
    pub created_at: i64,
    pub last_activity_at: i64,
    pub message_count: u64,
}

#[derive(Default)]
pub struct SessionRegistry {
    sessions: DashMap<SessionId, Session>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, key: &ConversationKey) -> Session {
        let now = now_millis();
        let session = Session {
            session_id: SessionId::new(),
            conversation_id: key.conversation_id.clone(),
            project_id: key.project_id.clone(),
            created_at: now,
            last_activity_at: now,
            message_count: 0,
        };
        self.sessions
            .insert(session.session_id.clone(), session.clone());
        session
    }

    pub fn touch(&self, id: &SessionId) {
        if let Some(mut s) = self.sessions.get_mut(id) {
            s.last_activity_at = now_millis();
            s.message_count += 1;
        }
    }

    pub fn remove(&self, id: &SessionId) -> Option<Session> {
        self.sessions.remove(id).map(|(_, s)| s)
    }

    pub fn get(&self, id: &SessionId) -> Option<Session> {
        self.sessions.get(id).map(|s| s.clone())
    }

    pub fn all_active(&self) -> Vec<Session> {
        self.sessions.iter().map(|s| s.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }
}
