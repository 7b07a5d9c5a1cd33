use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use convoy_core::types::now_millis;
use convoy_core::{ConnId, ConversationKey, ConvoyError, SessionId};
use convoy_protocol::{Metadata, OutboundFrame, OutboundMessage};
use dashmap::DashMap;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// One live WebSocket. The socket itself is owned by its connection task;
/// everyone else reaches it through the outbound queue.
#[derive(Debug)]
pub struct ConnectionHandle {
    pub conn_id: ConnId,
    pub key: ConversationKey,
    pub session_id: SessionId,
    pub connected_at: i64,
    last_activity_at: AtomicI64,
    message_count: AtomicU64,
    /// Cleared by each heartbeat tick, set again by any inbound traffic.
    pub alive: AtomicBool,
    tx: mpsc::Sender<String>,
    /// Cancelled once a message could not be queued; the connection task
    /// then closes the socket.
    evicted: CancellationToken,
}

impl ConnectionHandle {
    pub fn new(
        key: ConversationKey,
        session_id: SessionId,
        tx: mpsc::Sender<String>,
    ) -> Self {
        let now = now_millis();
        Self {
            conn_id: ConnId::new(),
            key,
            session_id,
            connected_at: now,
            last_activity_at: AtomicI64::new(now),
            message_count: AtomicU64::new(0),
            alive: AtomicBool::new(true),
            tx,
            evicted: CancellationToken::new(),
        }
    }

    /// Record one inbound message.
    pub fn touch(&self) {
        self.last_activity_at.store(now_millis(), Ordering::Relaxed);
        self.message_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn last_activity_at(&self) -> i64 {
        self.last_activity_at.load(Ordering::Relaxed)
    }

    pub fn message_count(&self) -> u64 {
        self.message_count.load(Ordering::Relaxed)
    }

    fn metadata(&self) -> Metadata {
        Metadata::now()
            .with_conversation(self.key.conversation_id.clone())
            .with_session(self.session_id.as_str())
    }

    /// Resolves once the connection has been evicted for falling behind.
    pub async fn evicted(&self) {
        self.evicted.cancelled().await
    }

    pub fn is_evicted(&self) -> bool {
        self.evicted.is_cancelled()
    }

    /// Queue a message for this connection only. Never blocks. A full queue
    /// evicts the connection, so it never sees a stream with a gap in it.
    pub fn send(&self, message: OutboundMessage) -> bool {
        self.send_frame(OutboundFrame::new(message, self.metadata()))
    }

    /// Like [`send`](Self::send) but echoes the id of the inbound message.
    pub fn reply(&self, reply_to: &str, message: OutboundMessage) -> bool {
        self.send_frame(OutboundFrame::reply(reply_to, message, self.metadata()))
    }

    fn send_frame(&self, frame: OutboundFrame) -> bool {
        self.send_raw(frame.to_json())
    }

    fn send_raw(&self, json: String) -> bool {
        match self.tx.try_send(json) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                if !self.evicted.is_cancelled() {
                    warn!(conn_id = %self.conn_id, conversation = %self.key, "outbound queue full, evicting");
                    self.evicted.cancel();
                }
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(conn_id = %self.conn_id, "outbound queue closed");
                false
            }
        }
    }
}

/// Live connections, indexed by id and by conversation.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: DashMap<ConnId, Arc<ConnectionHandle>>,
    by_conversation: DashMap<ConversationKey, HashSet<ConnId>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: ConnectionHandle) -> Result<Arc<ConnectionHandle>, ConvoyError> {
        if handle.key.project_id.trim().is_empty() {
            return Err(ConvoyError::MissingContext("projectId"));
        }
        let handle = Arc::new(handle);
        self.by_conversation
            .entry(handle.key.clone())
            .or_default()
            .insert(handle.conn_id.clone());
        self.connections
            .insert(handle.conn_id.clone(), Arc::clone(&handle));
        Ok(handle)
    }

    /// Returns the handle the first time; later calls for the same id are no-ops.
    pub fn unregister(&self, conn_id: &ConnId) -> Option<Arc<ConnectionHandle>> {
        let (_, handle) = self.connections.remove(conn_id)?;
        self.by_conversation
            .remove_if_mut(&handle.key, |_, ids| {
                ids.remove(conn_id);
                ids.is_empty()
            });
        Some(handle)
    }

    pub fn get(&self, conn_id: &ConnId) -> Option<Arc<ConnectionHandle>> {
        self.connections.get(conn_id).map(|h| Arc::clone(h.value()))
    }

    pub fn connections_for(&self, key: &ConversationKey) -> Vec<Arc<ConnectionHandle>> {
        let Some(ids) = self.by_conversation.get(key) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| self.connections.get(id).map(|h| Arc::clone(h.value())))
            .collect()
    }

    /// Send to every connection on the conversation; returns how many
    /// accepted it. A connection that could not take the message is
    /// unregistered on the spot and receives nothing further.
    pub fn broadcast(&self, key: &ConversationKey, message: OutboundMessage) -> usize {
        let targets = self.connections_for(key);
        if targets.is_empty() {
            return 0;
        }
        let kind = message.kind();
        let frame = OutboundFrame::new(
            message,
            Metadata::now().with_conversation(key.conversation_id.clone()),
        );
        let json = frame.to_json();
        let mut delivered = 0;
        for conn in &targets {
            if conn.send_raw(json.clone()) {
                delivered += 1;
            } else {
                self.unregister(&conn.conn_id);
            }
        }
        debug!(conversation = %key, kind, delivered, total = targets.len(), "broadcast");
        delivered
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }
}
