//! The transport port: the abstract boundary between the sync session and
//! whatever carries its calls to the server of record.
//!
//! Implementations own connection plumbing; the session only sees typed
//! request/response calls plus a per-topic subscription stream of raw
//! payloads. Every call carries the bearer credential supplied by the
//! injected [`AuthProvider`]; credential refresh lives outside this crate.

use async_trait::async_trait;
use std::fmt;
use tokio::sync::mpsc;

use crate::protocol::{
    GetActiveUsersRequest, GetActiveUsersResponse, JoinSessionRequest, JoinSessionResponse,
    LeaveSessionRequest, LeaveSessionResponse, SyncDocumentRequest, SyncDocumentResponse,
    UpdateActivityRequest, UpdateActivityResponse,
};

/// Why the server refused a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    /// Credential missing/expired; surfaced for the auth collaborator.
    Unauthorized,
    /// Unknown document or session.
    NotFound,
    /// The request itself was invalid (bad operations, malformed payload).
    Invalid,
    /// Server-side failure.
    Internal,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            RejectReason::Unauthorized => "unauthorized",
            RejectReason::NotFound => "not found",
            RejectReason::Invalid => "invalid request",
            RejectReason::Internal => "internal server error",
        };
        f.write_str(s)
    }
}

/// Network/server failure of a transport call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The call did not complete in time. May be retried with backoff.
    Timeout,
    /// The server could not be reached. May be retried with backoff.
    Unreachable(String),
    /// The server answered and said no. Not retried automatically.
    ServerRejected(RejectReason),
}

impl TransportError {
    /// Whether a caller-side retry with backoff is reasonable.
    pub fn is_retryable(&self) -> bool {
        matches!(self, TransportError::Timeout | TransportError::Unreachable(_))
    }

    /// Whether this failure is for the auth collaborator to resolve.
    pub fn is_auth_rejection(&self) -> bool {
        matches!(
            self,
            TransportError::ServerRejected(RejectReason::Unauthorized)
        )
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::Timeout => write!(f, "transport timeout"),
            TransportError::Unreachable(detail) => write!(f, "server unreachable: {}", detail),
            TransportError::ServerRejected(reason) => write!(f, "server rejected: {}", reason),
        }
    }
}

impl std::error::Error for TransportError {}

/// Supplies the bearer credential attached to every transport call.
pub trait AuthProvider: Send + Sync {
    fn bearer_token(&self) -> String;
}

/// A fixed-token provider, enough for tests and the demo.
pub struct StaticAuth(pub String);

impl AuthProvider for StaticAuth {
    fn bearer_token(&self) -> String {
        self.0.clone()
    }
}

/// Owned handle to one topic's change feed.
///
/// Payloads arrive in receipt order as raw bytes; decoding (and dropping
/// malformed messages) is the subscriber's job. Dropping or [`cancel`]ing the
/// handle ends delivery; there is no silent last-writer-wins callback map.
///
/// [`cancel`]: Subscription::cancel
pub struct Subscription {
    topic: String,
    rx: mpsc::Receiver<Vec<u8>>,
}

impl Subscription {
    pub fn new(topic: impl Into<String>, rx: mpsc::Receiver<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            rx,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Await the next payload; `None` once the publisher side is gone.
    pub async fn next(&mut self) -> Option<Vec<u8>> {
        self.rx.recv().await
    }

    /// Non-blocking poll for an already-delivered payload.
    pub fn try_next(&mut self) -> Option<Vec<u8>> {
        self.rx.try_recv().ok()
    }

    /// Stop receiving. Equivalent to dropping the handle.
    pub fn cancel(self) {}
}

/// The consumed server-of-record interface.
///
/// Logical delivery on subscriptions is at-least-once: subscribers must
/// tolerate duplicates and replays (the session's version check does).
/// Subscribing to a topic already subscribed replaces the prior subscription;
/// `unsubscribe` is idempotent.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn join_session(
        &self,
        req: JoinSessionRequest,
        bearer: &str,
    ) -> Result<JoinSessionResponse, TransportError>;

    async fn leave_session(
        &self,
        req: LeaveSessionRequest,
        bearer: &str,
    ) -> Result<LeaveSessionResponse, TransportError>;

    async fn get_active_users(
        &self,
        req: GetActiveUsersRequest,
        bearer: &str,
    ) -> Result<GetActiveUsersResponse, TransportError>;

    async fn sync_document(
        &self,
        req: SyncDocumentRequest,
        bearer: &str,
    ) -> Result<SyncDocumentResponse, TransportError>;

    async fn update_activity(
        &self,
        req: UpdateActivityRequest,
        bearer: &str,
    ) -> Result<UpdateActivityResponse, TransportError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError>;

    async fn unsubscribe(&self, topic: &str);
}
