//! In-process server of record.
//!
//! A faithful stand-in for the real backend used by integration tests and the
//! demo binary: it sequences operation batches per document, keeps the change
//! history needed to answer stale-base syncs, tracks the roster, and fans
//! every accepted change and presence update out to topic subscribers.
//!
//! Bearer tokens take the form `user_id:username`; anything else is rejected
//! as unauthorized.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::document::{Document, Version};
use crate::operation::apply_batch;
use crate::protocol::{
    encode_message, ActiveUser, DocumentChange, GetActiveUsersRequest, GetActiveUsersResponse,
    JoinSessionRequest, JoinSessionResponse, LeaveSessionRequest, LeaveSessionResponse,
    PresenceUpdate, ServerMessage, SyncDocumentRequest, SyncDocumentResponse,
    UpdateActivityRequest, UpdateActivityResponse,
};
use crate::transport::{RejectReason, Subscription, Transport, TransportError};

/// Subscription channel capacity per subscriber.
const TOPIC_CHANNEL_CAPACITY: usize = 64;

fn document_topic(document_id: &str) -> String {
    format!("documents/{}/changes", document_id)
}

fn parse_bearer(bearer: &str) -> Result<(String, String), TransportError> {
    match bearer.split_once(':') {
        Some((user_id, username)) if !user_id.is_empty() && !username.is_empty() => {
            Ok((user_id.to_string(), username.to_string()))
        }
        _ => Err(TransportError::ServerRejected(RejectReason::Unauthorized)),
    }
}

struct ServerDocument {
    content: String,
    counter: u64,
    version: Version,
    history: Vec<DocumentChange>,
}

impl ServerDocument {
    fn new(content: String) -> Self {
        Self {
            content,
            counter: 0,
            version: Version::new("0"),
            history: Vec::new(),
        }
    }
}

struct ServerSession {
    document_id: String,
    user: ActiveUser,
}

#[derive(Default)]
struct ServerState {
    documents: HashMap<String, ServerDocument>,
    sessions: HashMap<String, ServerSession>,
    subscribers: HashMap<(String, Uuid), mpsc::Sender<Vec<u8>>>,
}

impl ServerState {
    fn roster(&self, document_id: &str) -> Vec<ActiveUser> {
        let mut users: Vec<ActiveUser> = Vec::new();
        for session in self.sessions.values() {
            if session.document_id == document_id
                && !users.iter().any(|u| u.user_id == session.user.user_id)
            {
                users.push(session.user.clone());
            }
        }
        users
    }

    fn user_still_present(&self, document_id: &str, user_id: &str) -> bool {
        self.sessions
            .values()
            .any(|s| s.document_id == document_id && s.user.user_id == user_id)
    }

    fn publish(&self, topic: &str, msg: &ServerMessage) {
        let payload = match encode_message(msg) {
            Ok(p) => p,
            Err(e) => {
                log::warn!("failed to encode topic message: {}", e);
                return;
            }
        };
        for ((t, _), tx) in &self.subscribers {
            if t == topic {
                if tx.try_send(payload.clone()).is_err() {
                    log::warn!("subscriber channel full on {}, dropping message", topic);
                }
            }
        }
    }
}

/// Shared in-process sequencer of record. Create per-client [`LocalTransport`]
/// handles with [`transport`](Self::transport).
pub struct LocalServer {
    state: Mutex<ServerState>,
}

impl LocalServer {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ServerState::default()),
        })
    }

    /// Seed a document and return the snapshot clients join with.
    pub async fn create_document(&self, document_id: &str, content: &str) -> Document {
        let mut state = self.state.lock().await;
        let doc = state
            .documents
            .entry(document_id.to_string())
            .or_insert_with(|| ServerDocument::new(content.to_string()));
        Document::new(doc.content.clone(), doc.version.clone())
    }

    /// Current canonical snapshot, if the document exists.
    pub async fn document(&self, document_id: &str) -> Option<Document> {
        let state = self.state.lock().await;
        state
            .documents
            .get(document_id)
            .map(|doc| Document::new(doc.content.clone(), doc.version.clone()))
    }

    /// A transport handle with its own subscriber identity.
    pub fn transport(self: &Arc<Self>) -> LocalTransport {
        LocalTransport {
            server: Arc::clone(self),
            subscriber: Uuid::new_v4(),
        }
    }
}

/// One client's view of the [`LocalServer`], implementing the transport port.
pub struct LocalTransport {
    server: Arc<LocalServer>,
    subscriber: Uuid,
}

#[async_trait]
impl Transport for LocalTransport {
    async fn join_session(
        &self,
        req: JoinSessionRequest,
        bearer: &str,
    ) -> Result<JoinSessionResponse, TransportError> {
        let (user_id, username) = parse_bearer(bearer)?;
        let mut state = self.server.state.lock().await;
        if !state.documents.contains_key(&req.document_id) {
            return Err(TransportError::ServerRejected(RejectReason::NotFound));
        }

        let session_id = Uuid::new_v4().to_string();
        let user = ActiveUser::new(user_id, username);
        state.sessions.insert(
            session_id.clone(),
            ServerSession {
                document_id: req.document_id.clone(),
                user: user.clone(),
            },
        );

        let topic = document_topic(&req.document_id);
        state.publish(&topic, &ServerMessage::Presence(PresenceUpdate::Join { user }));

        Ok(JoinSessionResponse {
            session_id,
            active_users: state.roster(&req.document_id),
            topic,
        })
    }

    async fn leave_session(
        &self,
        req: LeaveSessionRequest,
        bearer: &str,
    ) -> Result<LeaveSessionResponse, TransportError> {
        let (user_id, _) = parse_bearer(bearer)?;
        let mut state = self.server.state.lock().await;

        // Leaving an unknown session is still a success: leave is idempotent.
        state.sessions.remove(&req.session_id);
        if !state.user_still_present(&req.document_id, &user_id) {
            state.publish(
                &document_topic(&req.document_id),
                &ServerMessage::Presence(PresenceUpdate::Leave { user_id }),
            );
        }
        Ok(LeaveSessionResponse { success: true })
    }

    async fn get_active_users(
        &self,
        req: GetActiveUsersRequest,
        bearer: &str,
    ) -> Result<GetActiveUsersResponse, TransportError> {
        parse_bearer(bearer)?;
        let state = self.server.state.lock().await;
        Ok(GetActiveUsersResponse {
            active_users: state.roster(&req.document_id),
        })
    }

    async fn sync_document(
        &self,
        req: SyncDocumentRequest,
        bearer: &str,
    ) -> Result<SyncDocumentResponse, TransportError> {
        let (user_id, _) = parse_bearer(bearer)?;
        let mut state = self.server.state.lock().await;
        let doc = state
            .documents
            .get_mut(&req.document_id)
            .ok_or(TransportError::ServerRejected(RejectReason::NotFound))?;

        if req.base_version != doc.version {
            // Stale base: hand back everything accepted since it.
            let concurrent_changes = doc
                .history
                .iter()
                .filter(|c| c.version.newer_than(&req.base_version))
                .cloned()
                .collect();
            return Ok(SyncDocumentResponse {
                success: false,
                new_version: doc.version.clone(),
                concurrent_changes,
            });
        }

        let new_content = apply_batch(&doc.content, &req.operations)
            .map_err(|_| TransportError::ServerRejected(RejectReason::Invalid))?;

        doc.counter += 1;
        doc.content = new_content;
        doc.version = Version::new(doc.counter.to_string());
        let change = DocumentChange {
            document_id: req.document_id.clone(),
            user_id,
            version: doc.version.clone(),
            operations: req.operations,
            timestamp: Utc::now(),
        };
        doc.history.push(change.clone());
        let new_version = doc.version.clone();

        state.publish(
            &document_topic(&req.document_id),
            &ServerMessage::Change(change),
        );

        Ok(SyncDocumentResponse {
            success: true,
            new_version,
            concurrent_changes: Vec::new(),
        })
    }

    async fn update_activity(
        &self,
        req: UpdateActivityRequest,
        bearer: &str,
    ) -> Result<UpdateActivityResponse, TransportError> {
        let (user_id, _) = parse_bearer(bearer)?;
        let mut state = self.server.state.lock().await;
        for session in state.sessions.values_mut() {
            if session.document_id == req.document_id && session.user.user_id == user_id {
                session.user.cursor_position = req.cursor_position.clone();
                session.user.last_active = Utc::now();
            }
        }
        state.publish(
            &document_topic(&req.document_id),
            &ServerMessage::Presence(PresenceUpdate::Cursor {
                user_id,
                cursor_position: req.cursor_position,
            }),
        );
        Ok(UpdateActivityResponse { success: true })
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
        let (tx, rx) = mpsc::channel(TOPIC_CHANNEL_CAPACITY);
        let mut state = self.server.state.lock().await;
        // Re-subscribing replaces this subscriber's previous channel.
        state
            .subscribers
            .insert((topic.to_string(), self.subscriber), tx);
        Ok(Subscription::new(topic, rx))
    }

    async fn unsubscribe(&self, topic: &str) {
        let mut state = self.server.state.lock().await;
        state
            .subscribers
            .remove(&(topic.to_string(), self.subscriber));
    }
}
