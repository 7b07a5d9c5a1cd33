use convoy_core::ConversationKey;
use serde::Deserialize;

use crate::error::ProtocolError;

/// Conversation used when the upgrade request names none.
pub const DEFAULT_CONVERSATION: &str = "default";

/// Query parameters on the upgrade request:
/// `GET /ws?projectId=p1&conversationId=c1&token=...`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectParams {
    pub conversation_id: Option<String>,
    pub project_id: Option<String>,
    pub token: Option<String>,
}

impl ConnectParams {
    /// Resolve the conversation this connection attaches to.
    ///
    /// A missing or blank `projectId` is rejected: every persistence
    /// operation keys on it.
    pub fn conversation_key(&self) -> Result<ConversationKey, ProtocolError> {
        let project = self
            .project_id
            .as_deref()
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .ok_or(ProtocolError::MissingParam("projectId"))?;
        let conversation = self
            .conversation_id
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .unwrap_or(DEFAULT_CONVERSATION);
        Ok(ConversationKey::new(project, conversation))
    }
}
