pub mod diff;
pub mod document;
pub mod local;
pub mod operation;
pub mod presence;
pub mod protocol;
pub mod session;
pub mod transport;

pub use diff::diff;
pub use document::{Document, Version};
pub use local::{LocalServer, LocalTransport};
pub use operation::{
    adjust_for_concurrent, apply, apply_batch, BatchApplyError, Operation, OperationKind,
    RangeError,
};
pub use presence::PresenceTracker;
pub use protocol::{
    ActiveUser, DocumentChange, JoinSessionResponse, PresenceUpdate, ServerMessage,
    SyncDocumentResponse,
};
pub use session::{
    SessionError, SessionHandle, SessionState, SyncSession, DEFAULT_MAX_SYNC_ATTEMPTS,
};
pub use transport::{
    AuthProvider, RejectReason, StaticAuth, Subscription, Transport, TransportError,
};
