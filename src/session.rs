//! Per-document collaboration session.
//!
//! One `SyncSession` owns one document's lifecycle: join, track the base
//! version, buffer and coalesce local edits, exchange them with the server of
//! record, reconcile concurrent remote edits, and leave. All mutation happens
//! through `&mut self`, so a session is a single logical execution context;
//! independent documents get independent sessions.

use std::fmt;
use std::sync::Arc;

use crate::diff::diff;
use crate::document::{Document, Version};
use crate::operation::{adjust_for_concurrent, apply_batch, BatchApplyError, Operation};
use crate::presence::PresenceTracker;
use crate::protocol::{
    decode_message, DocumentChange, GetActiveUsersRequest, JoinSessionRequest,
    LeaveSessionRequest, ServerMessage, SyncDocumentRequest, UpdateActivityRequest,
};
use crate::transport::{AuthProvider, Subscription, Transport, TransportError};

/// Default bound on the rebase-and-resend loop.
pub const DEFAULT_MAX_SYNC_ATTEMPTS: usize = 5;

/// Lifecycle state of a [`SyncSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Joining,
    Active,
    Leaving,
    /// Unrecoverable transport failure during join or sync; an explicit
    /// `join` recovers.
    Faulted,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            SessionState::Idle => "idle",
            SessionState::Joining => "joining",
            SessionState::Active => "active",
            SessionState::Leaving => "leaving",
            SessionState::Faulted => "faulted",
        };
        f.write_str(s)
    }
}

/// The live association between this client and one document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    pub session_id: String,
    pub document_id: String,
    pub base_version: Version,
    pub topic: String,
}

/// Failure surfaced by session operations.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionError {
    Transport(TransportError),
    Apply(BatchApplyError),
    /// The rebase-and-resend loop exceeded its bound; the caller must
    /// re-fetch document state to resolve the conflict.
    ConflictExceeded { attempts: usize },
    /// The operation is not valid in the session's current state.
    InvalidState { actual: SessionState },
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Transport(e) => write!(f, "transport failure: {}", e),
            SessionError::Apply(e) => write!(f, "failed to apply operations: {}", e),
            SessionError::ConflictExceeded { attempts } => {
                write!(f, "unresolved conflict after {} sync attempts", attempts)
            }
            SessionError::InvalidState { actual } => {
                write!(f, "operation not valid while session is {}", actual)
            }
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Transport(e) => Some(e),
            SessionError::Apply(e) => Some(e),
            _ => None,
        }
    }
}

impl From<TransportError> for SessionError {
    fn from(e: TransportError) -> Self {
        SessionError::Transport(e)
    }
}

impl From<BatchApplyError> for SessionError {
    fn from(e: BatchApplyError) -> Self {
        SessionError::Apply(e)
    }
}

/// Local operations generated since the last acknowledged base version.
#[derive(Debug, Default)]
struct PendingBatch {
    ops: Vec<Operation>,
}

impl PendingBatch {
    fn extend(&mut self, ops: Vec<Operation>) {
        self.ops.extend(ops);
    }

    fn snapshot(&self, n: usize) -> Vec<Operation> {
        self.ops[..n].to_vec()
    }

    fn drain_acked(&mut self, n: usize) {
        self.ops.drain(..n);
    }

    fn len(&self) -> usize {
        self.ops.len()
    }

    fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    fn clear(&mut self) {
        self.ops.clear();
    }
}

/// Client-side synchronization session for one document.
pub struct SyncSession {
    transport: Arc<dyn Transport>,
    auth: Arc<dyn AuthProvider>,
    user_id: String,
    username: String,
    state: SessionState,
    handle: Option<SessionHandle>,
    subscription: Option<Subscription>,
    content: String,
    pending: PendingBatch,
    presence: PresenceTracker,
    max_sync_attempts: usize,
}

impl SyncSession {
    pub fn new(
        transport: Arc<dyn Transport>,
        auth: Arc<dyn AuthProvider>,
        user_id: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            transport,
            auth,
            user_id: user_id.into(),
            username: username.into(),
            state: SessionState::Idle,
            handle: None,
            subscription: None,
            content: String::new(),
            pending: PendingBatch::default(),
            presence: PresenceTracker::new(),
            max_sync_attempts: DEFAULT_MAX_SYNC_ATTEMPTS,
        }
    }

    /// Override the bound on the rebase-and-resend loop.
    pub fn with_max_sync_attempts(mut self, attempts: usize) -> Self {
        self.max_sync_attempts = attempts.max(1);
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// The local view of the document content, including unacknowledged edits.
    pub fn content(&self) -> &str {
        &self.content
    }

    pub fn handle(&self) -> Option<&SessionHandle> {
        self.handle.as_ref()
    }

    pub fn base_version(&self) -> Option<&Version> {
        self.handle.as_ref().map(|h| &h.base_version)
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn presence(&self) -> &PresenceTracker {
        &self.presence
    }

    /// Buffered local operations not yet acknowledged by the server.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn has_pending_edits(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Join a document's collaboration session.
    ///
    /// `initial` is the snapshot the document collaborator fetched; its
    /// version seeds the base version. A session already live (including one
    /// stuck in `Faulted`) is left first so a document never has two
    /// subscriptions. Join failure moves the session to `Faulted`; calling
    /// `join` again retries.
    pub async fn join(
        &mut self,
        document_id: &str,
        initial: Document,
    ) -> Result<(), SessionError> {
        if matches!(self.state, SessionState::Active | SessionState::Faulted) {
            self.leave().await?;
        }
        self.state = SessionState::Joining;

        let bearer = self.auth.bearer_token();
        let request = JoinSessionRequest {
            document_id: document_id.to_string(),
        };
        let joined = match self.transport.join_session(request, &bearer).await {
            Ok(response) => response,
            Err(e) => {
                self.state = SessionState::Faulted;
                return Err(e.into());
            }
        };

        let subscription = match self.transport.subscribe(&joined.topic).await {
            Ok(subscription) => subscription,
            Err(e) => {
                self.state = SessionState::Faulted;
                return Err(e.into());
            }
        };

        log::debug!(
            "joined {} as session {} at {}",
            document_id,
            joined.session_id,
            initial.version
        );

        self.handle = Some(SessionHandle {
            session_id: joined.session_id,
            document_id: document_id.to_string(),
            base_version: initial.version,
            topic: joined.topic,
        });
        self.subscription = Some(subscription);
        self.content = initial.content;
        self.pending.clear();
        self.presence.reset(joined.active_users);
        self.state = SessionState::Active;
        Ok(())
    }

    /// Record a local edit: diff the new content against the last-known local
    /// content and buffer the resulting operations. Never blocks; call
    /// [`flush`](Self::flush) to push buffered edits to the server.
    pub fn edit(&mut self, new_content: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState { actual: self.state });
        }
        let ops = diff(&self.content, new_content);
        if ops.is_empty() {
            return Ok(());
        }
        self.pending.extend(ops);
        self.content = new_content.to_string();
        Ok(())
    }

    /// Send the pending batch to the server and reconcile the answer.
    ///
    /// Rapid edits coalesce: everything buffered by the time `flush` runs goes
    /// out as one batch. The session is driven through `&mut self`, so no edit
    /// or leave can interleave with a flush in flight. A stale base version is
    /// handled by applying the server's concurrent changes, rebasing the batch
    /// and resending, bounded by the attempt cap.
    pub async fn flush(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState { actual: self.state });
        }
        if self.pending.is_empty() {
            return Ok(());
        }
        self.flush_batch().await
    }

    async fn flush_batch(&mut self) -> Result<(), SessionError> {
        let document_id = match self.handle.as_ref() {
            Some(h) => h.document_id.clone(),
            None => return Err(SessionError::InvalidState { actual: self.state }),
        };

        for attempt in 1..=self.max_sync_attempts {
            // Rebasing on a previous attempt may have consumed the whole
            // batch, e.g. a remote delete covering everything a pending
            // delete covered. Nothing is left to send then.
            if self.pending.is_empty() {
                return Ok(());
            }
            let acked = self.pending.len();
            let base_version = match self.handle.as_ref() {
                Some(h) => h.base_version.clone(),
                None => return Err(SessionError::InvalidState { actual: self.state }),
            };
            let request = SyncDocumentRequest {
                document_id: document_id.clone(),
                operations: self.pending.snapshot(acked),
                base_version,
            };
            let bearer = self.auth.bearer_token();
            let response = self.transport.sync_document(request, &bearer).await?;

            if response.success {
                self.pending.drain_acked(acked);
                self.advance_base_version(response.new_version);
                // Edits from other users accepted in the same round are
                // already expressed relative to the new baseline; they only
                // need folding into the local view.
                for change in &response.concurrent_changes {
                    self.integrate(change)?;
                    self.advance_base_version(change.version.clone());
                }
                return Ok(());
            }

            log::debug!(
                "sync attempt {} stale: {} concurrent change(s), rebasing",
                attempt,
                response.concurrent_changes.len()
            );
            for change in response.concurrent_changes {
                self.reconcile_concurrent(&change)?;
            }
            self.advance_base_version(response.new_version);
        }

        Err(SessionError::ConflictExceeded {
            attempts: self.max_sync_attempts,
        })
    }

    /// Apply one server-accepted concurrent change and rebase the pending
    /// batch past it. Skips changes at or below the base version, so server
    /// replays are harmless.
    fn reconcile_concurrent(&mut self, change: &DocumentChange) -> Result<(), SessionError> {
        let is_newer = match self.handle.as_ref() {
            Some(h) => change.version.newer_than(&h.base_version),
            None => false,
        };
        if !is_newer {
            return Ok(());
        }
        self.integrate(change)?;
        self.advance_base_version(change.version.clone());
        Ok(())
    }

    /// Fold a server-accepted change into the local view.
    ///
    /// The change's operations are expressed against server content, but the
    /// local content already contains the unacknowledged pending batch. Both
    /// sides are therefore transformed: each remote operation is shifted past
    /// the pending batch before it touches local content, and the pending
    /// batch is rebased past the remote operation as sent, so the rebased
    /// batch stays valid against server content. Using the same tie-break in
    /// both directions is what makes every participant order same-position
    /// edits identically. Failure leaves content and batch untouched.
    fn integrate(&mut self, change: &DocumentChange) -> Result<(), BatchApplyError> {
        let mut rebased = self.pending.ops.clone();
        let mut localized = Vec::with_capacity(change.operations.len());
        for remote in &change.operations {
            // Walk the remote op through the batch pairwise: each pending op
            // is expressed in coordinates that include the ones before it, so
            // it must see the remote op as transformed up to that point, and
            // vice versa.
            let mut local_op = remote.clone();
            for pending in &mut rebased {
                let pending_next =
                    adjust_for_concurrent(pending, &local_op, &self.user_id, &change.user_id);
                local_op =
                    adjust_for_concurrent(&local_op, pending, &change.user_id, &self.user_id);
                *pending = pending_next;
            }
            rebased.retain(|op| !op.is_noop());
            localized.push(local_op);
        }

        self.content = apply_batch(&self.content, &localized)?;
        self.pending.ops = rebased;
        Ok(())
    }

    fn advance_base_version(&mut self, version: Version) {
        if let Some(handle) = self.handle.as_mut() {
            if version.newer_than(&handle.base_version) {
                handle.base_version = version;
            }
        }
    }

    /// Await the next subscription message and process it.
    ///
    /// Returns whether local content changed. Duplicates, own-user echoes and
    /// already-seen versions are discarded; malformed payloads are logged and
    /// dropped, never session-fatal.
    pub async fn next_remote(&mut self) -> Result<bool, SessionError> {
        let subscription = self
            .subscription
            .as_mut()
            .ok_or(SessionError::InvalidState { actual: self.state })?;
        match subscription.next().await {
            Some(payload) => Ok(self.process_payload(&payload)),
            None => Err(SessionError::Transport(TransportError::Unreachable(
                "change feed closed".to_string(),
            ))),
        }
    }

    /// Process every already-delivered subscription message without blocking.
    /// Returns how many changed local content.
    pub fn drain_remote(&mut self) -> usize {
        let mut applied = 0;
        loop {
            let payload = match self.subscription.as_mut().and_then(|s| s.try_next()) {
                Some(p) => p,
                None => return applied,
            };
            if self.process_payload(&payload) {
                applied += 1;
            }
        }
    }

    fn process_payload(&mut self, payload: &[u8]) -> bool {
        match decode_message(payload) {
            Ok(ServerMessage::Change(change)) => self.apply_remote_change(change),
            Ok(ServerMessage::Presence(update)) => {
                self.presence.apply(update);
                false
            }
            Err(e) => {
                log::warn!("dropping malformed subscription payload: {}", e);
                false
            }
        }
    }

    fn apply_remote_change(&mut self, change: DocumentChange) -> bool {
        let handle = match &self.handle {
            Some(h) => h,
            None => return false,
        };
        if change.document_id != handle.document_id {
            return false;
        }
        // Our own edits were already applied locally; the sync ack advanced
        // the base version past this echo as well.
        if change.user_id == self.user_id {
            return false;
        }
        if !change.version.newer_than(&handle.base_version) {
            log::debug!("ignoring already-seen change {}", change.version);
            return false;
        }

        match self.integrate(&change) {
            Ok(()) => {
                self.advance_base_version(change.version);
                true
            }
            Err(e) => {
                log::warn!("dropping remote change that does not fit local content: {}", e);
                false
            }
        }
    }

    /// Publish the local cursor position to other participants.
    pub async fn set_cursor(&mut self, position: &str) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState { actual: self.state });
        }
        let document_id = match self.handle.as_ref() {
            Some(h) => h.document_id.clone(),
            None => return Err(SessionError::InvalidState { actual: self.state }),
        };
        let bearer = self.auth.bearer_token();
        self.transport
            .update_activity(
                UpdateActivityRequest {
                    document_id,
                    cursor_position: position.to_string(),
                },
                &bearer,
            )
            .await?;
        Ok(())
    }

    /// Replace the roster from the server's authoritative answer.
    pub async fn refresh_presence(&mut self) -> Result<(), SessionError> {
        if self.state != SessionState::Active {
            return Err(SessionError::InvalidState { actual: self.state });
        }
        let document_id = match self.handle.as_ref() {
            Some(h) => h.document_id.clone(),
            None => return Err(SessionError::InvalidState { actual: self.state }),
        };
        let bearer = self.auth.bearer_token();
        let response = self
            .transport
            .get_active_users(GetActiveUsersRequest { document_id }, &bearer)
            .await?;
        self.presence.reset(response.active_users);
        Ok(())
    }

    /// Leave the session. Idempotent: leaving an idle or never-joined session
    /// is a no-op. The leave call itself is best-effort; local teardown
    /// always completes.
    pub async fn leave(&mut self) -> Result<(), SessionError> {
        if self.state == SessionState::Idle {
            return Ok(());
        }
        self.state = SessionState::Leaving;

        if let Some(subscription) = self.subscription.take() {
            let topic = subscription.topic().to_string();
            subscription.cancel();
            self.transport.unsubscribe(&topic).await;
        }

        if let Some(handle) = self.handle.take() {
            let bearer = self.auth.bearer_token();
            let request = LeaveSessionRequest {
                session_id: handle.session_id.clone(),
                document_id: handle.document_id.clone(),
            };
            if let Err(e) = self.transport.leave_session(request, &bearer).await {
                log::warn!("leave request for session {} failed: {}", handle.session_id, e);
            }
            log::debug!("left session {}", handle.session_id);
        }

        self.pending.clear();
        self.presence.clear();
        self.state = SessionState::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::Utc;
    use std::collections::VecDeque;
    use std::sync::Mutex;
    use tokio::sync::mpsc;

    use crate::protocol::{
        ActiveUser, GetActiveUsersResponse, JoinSessionResponse, LeaveSessionResponse,
        PresenceUpdate, SyncDocumentResponse, UpdateActivityResponse,
    };
    use crate::transport::{RejectReason, StaticAuth};

    fn change(
        user: &str,
        version: &str,
        operations: Vec<Operation>,
    ) -> DocumentChange {
        DocumentChange {
            document_id: "doc1".into(),
            user_id: user.into(),
            version: Version::new(version),
            operations,
            timestamp: Utc::now(),
        }
    }

    /// Scripted transport: join/sync answers are queued up front, every sync
    /// request is recorded, and the test feeds the subscription by hand.
    struct ScriptedTransport {
        join_results: Mutex<VecDeque<Result<JoinSessionResponse, TransportError>>>,
        sync_results: Mutex<VecDeque<Result<SyncDocumentResponse, TransportError>>>,
        sync_requests: Mutex<Vec<SyncDocumentRequest>>,
        leave_requests: Mutex<Vec<LeaveSessionRequest>>,
        cursor_requests: Mutex<Vec<UpdateActivityRequest>>,
        unsubscribes: Mutex<Vec<String>>,
        topic_tx: Mutex<Option<mpsc::Sender<Vec<u8>>>>,
    }

    impl ScriptedTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                join_results: Mutex::new(VecDeque::new()),
                sync_results: Mutex::new(VecDeque::new()),
                sync_requests: Mutex::new(Vec::new()),
                leave_requests: Mutex::new(Vec::new()),
                cursor_requests: Mutex::new(Vec::new()),
                unsubscribes: Mutex::new(Vec::new()),
                topic_tx: Mutex::new(None),
            })
        }

        fn queue_join_ok(&self) {
            self.join_results
                .lock()
                .unwrap()
                .push_back(Ok(JoinSessionResponse {
                    session_id: "sess-1".into(),
                    active_users: vec![ActiveUser::new("user-a", "Alice")],
                    topic: "documents/doc1/changes".into(),
                }));
        }

        fn queue_join_err(&self, e: TransportError) {
            self.join_results.lock().unwrap().push_back(Err(e));
        }

        fn queue_sync(&self, result: Result<SyncDocumentResponse, TransportError>) {
            self.sync_results.lock().unwrap().push_back(result);
        }

        fn queue_sync_ok(&self, new_version: &str, concurrent: Vec<DocumentChange>) {
            self.queue_sync(Ok(SyncDocumentResponse {
                success: true,
                new_version: Version::new(new_version),
                concurrent_changes: concurrent,
            }));
        }

        fn queue_sync_stale(&self, current: &str, concurrent: Vec<DocumentChange>) {
            self.queue_sync(Ok(SyncDocumentResponse {
                success: false,
                new_version: Version::new(current),
                concurrent_changes: concurrent,
            }));
        }

        async fn push(&self, msg: &ServerMessage) {
            let tx = self.topic_tx.lock().unwrap().clone().unwrap();
            tx.send(crate::protocol::encode_message(msg).unwrap())
                .await
                .unwrap();
        }

        async fn push_raw(&self, payload: &[u8]) {
            let tx = self.topic_tx.lock().unwrap().clone().unwrap();
            tx.send(payload.to_vec()).await.unwrap();
        }

        fn sync_request_count(&self) -> usize {
            self.sync_requests.lock().unwrap().len()
        }
    }

    #[async_trait]
    impl Transport for ScriptedTransport {
        async fn join_session(
            &self,
            _req: JoinSessionRequest,
            _bearer: &str,
        ) -> Result<JoinSessionResponse, TransportError> {
            self.join_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected join_session call"))
        }

        async fn leave_session(
            &self,
            req: LeaveSessionRequest,
            _bearer: &str,
        ) -> Result<LeaveSessionResponse, TransportError> {
            self.leave_requests.lock().unwrap().push(req);
            Ok(LeaveSessionResponse { success: true })
        }

        async fn get_active_users(
            &self,
            _req: GetActiveUsersRequest,
            _bearer: &str,
        ) -> Result<GetActiveUsersResponse, TransportError> {
            Ok(GetActiveUsersResponse {
                active_users: vec![
                    ActiveUser::new("user-a", "Alice"),
                    ActiveUser::new("user-b", "Bob"),
                ],
            })
        }

        async fn sync_document(
            &self,
            req: SyncDocumentRequest,
            _bearer: &str,
        ) -> Result<SyncDocumentResponse, TransportError> {
            self.sync_requests.lock().unwrap().push(req);
            self.sync_results
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| panic!("unexpected sync_document call"))
        }

        async fn update_activity(
            &self,
            req: UpdateActivityRequest,
            _bearer: &str,
        ) -> Result<UpdateActivityResponse, TransportError> {
            self.cursor_requests.lock().unwrap().push(req);
            Ok(UpdateActivityResponse { success: true })
        }

        async fn subscribe(&self, topic: &str) -> Result<Subscription, TransportError> {
            let (tx, rx) = mpsc::channel(64);
            *self.topic_tx.lock().unwrap() = Some(tx);
            Ok(Subscription::new(topic, rx))
        }

        async fn unsubscribe(&self, topic: &str) {
            self.unsubscribes.lock().unwrap().push(topic.to_string());
        }
    }

    fn session(transport: &Arc<ScriptedTransport>) -> SyncSession {
        SyncSession::new(
            Arc::clone(transport) as Arc<dyn Transport>,
            Arc::new(StaticAuth("user-b:Bob".into())),
            "user-b",
            "Bob",
        )
    }

    async fn joined_session(transport: &Arc<ScriptedTransport>, content: &str) -> SyncSession {
        transport.queue_join_ok();
        let mut s = session(transport);
        s.join("doc1", Document::new(content, Version::new("0")))
            .await
            .unwrap();
        s
    }

    #[tokio::test]
    async fn test_join_seeds_session_state() {
        let transport = ScriptedTransport::new();
        let s = joined_session(&transport, "hello").await;

        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.content(), "hello");
        assert_eq!(s.base_version().unwrap(), &Version::new("0"));
        let handle = s.handle().unwrap();
        assert_eq!(handle.session_id, "sess-1");
        assert_eq!(handle.topic, "documents/doc1/changes");
        assert_eq!(s.presence().len(), 1);
        assert_eq!(s.presence().list()[0].username, "Alice");
    }

    #[tokio::test]
    async fn test_join_failure_faults_and_retry_recovers() {
        let transport = ScriptedTransport::new();
        transport.queue_join_err(TransportError::Unreachable("refused".into()));
        let mut s = session(&transport);

        let err = s
            .join("doc1", Document::new("", Version::new("0")))
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Transport(_)));
        assert_eq!(s.state(), SessionState::Faulted);
        assert!(s.edit("nope").is_err());

        transport.queue_join_ok();
        s.join("doc1", Document::new("", Version::new("0")))
            .await
            .unwrap();
        assert_eq!(s.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_first_sync_happy_path() {
        // Join doc1 at v0, type "hi", server acknowledges with v1.
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.edit("hi").unwrap();
        transport.queue_sync_ok("1", vec![]);
        s.flush().await.unwrap();

        let requests = transport.sync_requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].base_version, Version::new("0"));
        assert_eq!(requests[0].operations, vec![Operation::insert(0, "hi")]);
        drop(requests);

        assert_eq!(s.base_version().unwrap(), &Version::new("1"));
        assert!(!s.has_pending_edits());
        assert_eq!(s.content(), "hi");
    }

    #[tokio::test]
    async fn test_two_edits_coalesce_into_one_request() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.edit("hi").unwrap();
        s.edit("hi there").unwrap();
        transport.queue_sync_ok("1", vec![]);
        s.flush().await.unwrap();

        assert_eq!(transport.sync_request_count(), 1);
        let requests = transport.sync_requests.lock().unwrap();
        assert_eq!(
            requests[0].operations,
            vec![Operation::insert(0, "hi"), Operation::insert(2, " there")]
        );
    }

    #[tokio::test]
    async fn test_flush_with_nothing_pending_sends_nothing() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "x").await;
        s.flush().await.unwrap();
        s.edit("x").unwrap(); // no-op diff
        s.flush().await.unwrap();
        assert_eq!(transport.sync_request_count(), 0);
    }

    #[tokio::test]
    async fn test_stale_base_rebases_and_resends() {
        // Server refuses v0 because user-a's "abc: " landed as v1; our
        // pending insert must shift past it and go out against v1.
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.edit("hi").unwrap();
        transport.queue_sync_stale(
            "1",
            vec![change("user-a", "1", vec![Operation::insert(0, "abc: ")])],
        );
        transport.queue_sync_ok("2", vec![]);
        s.flush().await.unwrap();

        let requests = transport.sync_requests.lock().unwrap();
        assert_eq!(requests.len(), 2);
        assert_eq!(requests[1].base_version, Version::new("1"));
        assert_eq!(requests[1].operations, vec![Operation::insert(5, "hi")]);
        drop(requests);

        assert_eq!(s.content(), "abc: hi");
        assert_eq!(s.base_version().unwrap(), &Version::new("2"));
        assert!(!s.has_pending_edits());
    }

    #[tokio::test]
    async fn test_pending_consumed_by_remote_delete_is_not_resent() {
        // Our delete of "cd" is fully contained in the remote delete of
        // "bcde" that won the race: rebasing leaves nothing to send, and the
        // retry loop must notice instead of slicing a drained batch.
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "abcdef").await;

        s.edit("abef").unwrap();
        transport.queue_sync_stale(
            "1",
            vec![change("user-a", "1", vec![Operation::delete(1, 4)])],
        );
        s.flush().await.unwrap();

        assert_eq!(transport.sync_request_count(), 1);
        assert_eq!(s.content(), "af");
        assert!(!s.has_pending_edits());
        assert_eq!(s.base_version().unwrap(), &Version::new("1"));
    }

    #[tokio::test]
    async fn test_conflict_loop_is_bounded() {
        let transport = ScriptedTransport::new();
        transport.queue_join_ok();
        let mut s = session(&transport).with_max_sync_attempts(3);
        s.join("doc1", Document::new("", Version::new("0")))
            .await
            .unwrap();

        s.edit("hi").unwrap();
        // The server keeps answering with the same stale verdict; the change
        // is only applied once (version check) and the loop must give up.
        for _ in 0..3 {
            transport.queue_sync_stale(
                "1",
                vec![change("user-a", "1", vec![Operation::insert(0, "x")])],
            );
        }
        let err = s.flush().await.unwrap_err();
        assert_eq!(err, SessionError::ConflictExceeded { attempts: 3 });
        assert_eq!(s.content(), "xhi");
        // Pending survives for a later retry or re-fetch.
        assert!(s.has_pending_edits());
    }

    #[tokio::test]
    async fn test_transport_failure_preserves_pending() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.edit("hi").unwrap();
        transport.queue_sync(Err(TransportError::Timeout));
        let err = s.flush().await.unwrap_err();
        assert_eq!(err, SessionError::Transport(TransportError::Timeout));
        assert_eq!(s.pending_len(), 1);

        // Retry after the timeout succeeds and drains the same batch.
        transport.queue_sync_ok("1", vec![]);
        s.flush().await.unwrap();
        assert!(!s.has_pending_edits());
    }

    #[tokio::test]
    async fn test_auth_rejection_is_surfaced() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;
        s.edit("hi").unwrap();
        transport.queue_sync(Err(TransportError::ServerRejected(
            RejectReason::Unauthorized,
        )));
        let err = s.flush().await.unwrap_err();
        match err {
            SessionError::Transport(e) => assert!(e.is_auth_rejection()),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_remote_change_applies_once() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "hello").await;

        let c = change("user-a", "1", vec![Operation::insert(5, "!")]);
        transport.push(&ServerMessage::Change(c.clone())).await;
        transport.push(&ServerMessage::Change(c)).await;

        assert_eq!(s.drain_remote(), 1);
        assert_eq!(s.content(), "hello!");
        assert_eq!(s.base_version().unwrap(), &Version::new("1"));
    }

    #[tokio::test]
    async fn test_own_echo_is_discarded() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "hello").await;

        transport
            .push(&ServerMessage::Change(change(
                "user-b",
                "1",
                vec![Operation::insert(0, "dup ")],
            )))
            .await;
        assert_eq!(s.drain_remote(), 0);
        assert_eq!(s.content(), "hello");
    }

    #[tokio::test]
    async fn test_remote_change_rebases_outstanding_pending() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.edit("hi").unwrap();
        transport
            .push(&ServerMessage::Change(change(
                "user-a",
                "1",
                vec![Operation::insert(0, "abc: ")],
            )))
            .await;
        assert_eq!(s.drain_remote(), 1);
        assert_eq!(s.content(), "abc: hi");

        transport.queue_sync_ok("2", vec![]);
        s.flush().await.unwrap();
        let requests = transport.sync_requests.lock().unwrap();
        assert_eq!(requests[0].base_version, Version::new("1"));
        assert_eq!(requests[0].operations, vec![Operation::insert(5, "hi")]);
    }

    #[tokio::test]
    async fn test_malformed_payload_is_dropped_not_fatal() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "hello").await;

        transport.push_raw(b"{definitely not json").await;
        transport
            .push(&ServerMessage::Change(change(
                "user-a",
                "1",
                vec![Operation::insert(0, "ok ")],
            )))
            .await;

        assert_eq!(s.drain_remote(), 1);
        assert_eq!(s.state(), SessionState::Active);
        assert_eq!(s.content(), "ok hello");
    }

    #[tokio::test]
    async fn test_presence_updates_feed_tracker() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;
        assert_eq!(s.presence().len(), 1);

        transport
            .push(&ServerMessage::Presence(PresenceUpdate::Join {
                user: ActiveUser::new("user-c", "Carol"),
            }))
            .await;
        transport
            .push(&ServerMessage::Presence(PresenceUpdate::Leave {
                user_id: "user-a".into(),
            }))
            .await;
        s.drain_remote();

        let names: Vec<_> = s.presence().list().iter().map(|u| u.username.as_str()).collect();
        assert_eq!(names, ["Carol"]);
    }

    #[tokio::test]
    async fn test_leave_is_idempotent() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "hi").await;
        s.edit("hi!").unwrap();

        s.leave().await.unwrap();
        assert_eq!(s.state(), SessionState::Idle);
        assert!(s.handle().is_none());
        assert!(!s.has_pending_edits());
        assert!(s.presence().is_empty());

        // Second leave, and leave on a fresh session, are no-ops.
        s.leave().await.unwrap();
        let mut never_joined = session(&transport);
        never_joined.leave().await.unwrap();

        assert_eq!(transport.leave_requests.lock().unwrap().len(), 1);
        assert_eq!(
            transport.unsubscribes.lock().unwrap().as_slice(),
            ["documents/doc1/changes"]
        );
    }

    #[tokio::test]
    async fn test_rejoin_leaves_stale_session_first() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "hi").await;

        transport.queue_join_ok();
        s.join("doc1", Document::new("hi", Version::new("5")))
            .await
            .unwrap();

        // The stale session was left before the new subscription was taken.
        assert_eq!(transport.leave_requests.lock().unwrap().len(), 1);
        assert_eq!(s.base_version().unwrap(), &Version::new("5"));
        assert_eq!(s.state(), SessionState::Active);
    }

    #[tokio::test]
    async fn test_set_cursor_and_refresh_presence() {
        let transport = ScriptedTransport::new();
        let mut s = joined_session(&transport, "").await;

        s.set_cursor("12").await.unwrap();
        let cursors = transport.cursor_requests.lock().unwrap();
        assert_eq!(cursors[0].cursor_position, "12");
        assert_eq!(cursors[0].document_id, "doc1");
        drop(cursors);

        s.refresh_presence().await.unwrap();
        assert_eq!(s.presence().len(), 2);
    }
}
