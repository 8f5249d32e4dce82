//! Generic session state machine.
//!
//! Every session kind (chat, file transfer, content sharing, calls) is built
//! on a [`SessionCore`] plus a [`SessionHandler`] implementation. The core
//! owns the dialog, the authentication agent and the invitation monitor; the
//! handler supplies the per-kind behavior and runs on its own tokio task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use tokio::sync::watch;

use crate::auth::{AuthenticationAgent, UserCredentials};
use crate::dialog::DialogPath;
use crate::message::{self, Method, Request, Response, SipMessage};
use crate::transport::SipManager;
use crate::Result;

/// The answer given (or not yet given) to a session invitation.
///
/// Transitions away from `NotAnswered` exactly once; the decision is final.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InvitationStatus {
    NotAnswered,
    Accepted,
    Rejected,
}

#[derive(Debug, Clone, Copy)]
struct InvitationState {
    status: InvitationStatus,
    /// Raised by termination to release waiters regardless of status.
    terminated: bool,
}

/// Registry of the live sessions owned by one service.
///
/// Tables stay small (tens of sessions), so lookup is a linear scan.
#[derive(Default)]
pub struct SessionTable {
    sessions: Mutex<Vec<Arc<dyn SessionHandler>>>,
}

impl SessionTable {
    pub fn new() -> Arc<Self> {
        Arc::new(SessionTable::default())
    }

    pub fn add(&self, session: Arc<dyn SessionHandler>) {
        self.sessions.lock().expect("lock failed").push(session);
    }

    pub fn remove(&self, call_id: &str) {
        self.sessions
            .lock()
            .expect("lock failed")
            .retain(|s| s.core().call_id() != call_id);
    }

    pub fn find(&self, call_id: &str) -> Option<Arc<dyn SessionHandler>> {
        self.sessions
            .lock()
            .expect("lock failed")
            .iter()
            .find(|s| s.core().call_id() == call_id)
            .cloned()
    }

    pub fn all(&self) -> Vec<Arc<dyn SessionHandler>> {
        self.sessions.lock().expect("lock failed").clone()
    }

    pub fn len(&self) -> usize {
        self.sessions.lock().expect("lock failed").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Stack-level inputs shared by every session a service creates.
#[derive(Clone)]
pub struct SessionContext {
    pub sip: Arc<dyn SipManager>,
    pub table: Arc<SessionTable>,
    pub credentials: UserCredentials,
    pub ringing_period: Duration,
    pub transaction_timeout: Duration,
}

/// State shared by all session kinds.
pub struct SessionCore {
    id: u64,
    remote_contact: String,
    sip: Arc<dyn SipManager>,
    table: Arc<SessionTable>,
    dialog: Mutex<DialogPath>,
    auth: Mutex<AuthenticationAgent>,
    /// The INVITE that created a terminating session, kept for responses.
    invite: Option<Request>,
    /// SDP answer attached to the 200 OK, produced by the media layer.
    local_content: Mutex<Option<String>>,
    invitation: watch::Sender<InvitationState>,
    ringing_period: Duration,
    transaction_timeout: Duration,
}

impl SessionCore {
    /// Core for a session created from an inbound INVITE.
    pub fn terminating(ctx: SessionContext, invite: Request) -> Result<Self> {
        let dialog = DialogPath::new_terminating(&invite)?;
        let remote_contact = invite.from_uri().unwrap_or_default();
        Ok(Self::with_dialog(ctx, dialog, remote_contact, Some(invite)))
    }

    /// Core for a locally originated session.
    pub fn originating(ctx: SessionContext, dialog: DialogPath) -> Self {
        let remote_contact = dialog.target().to_string();
        Self::with_dialog(ctx, dialog, remote_contact, None)
    }

    fn with_dialog(
        ctx: SessionContext,
        dialog: DialogPath,
        remote_contact: String,
        invite: Option<Request>,
    ) -> Self {
        let (invitation, _) = watch::channel(InvitationState {
            status: InvitationStatus::NotAnswered,
            terminated: false,
        });
        SessionCore {
            id: generate_session_id(),
            remote_contact,
            sip: ctx.sip,
            table: ctx.table,
            dialog: Mutex::new(dialog),
            auth: Mutex::new(AuthenticationAgent::new(ctx.credentials)),
            invite,
            local_content: Mutex::new(None),
            invitation,
            ringing_period: ctx.ringing_period,
            transaction_timeout: ctx.transaction_timeout,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn remote_contact(&self) -> &str {
        &self.remote_contact
    }

    pub fn call_id(&self) -> String {
        self.dialog.lock().expect("lock failed").call_id().to_string()
    }

    pub fn dialog(&self) -> &Mutex<DialogPath> {
        &self.dialog
    }

    pub fn auth(&self) -> &Mutex<AuthenticationAgent> {
        &self.auth
    }

    pub fn sip(&self) -> &Arc<dyn SipManager> {
        &self.sip
    }

    pub fn table(&self) -> &Arc<SessionTable> {
        &self.table
    }

    /// The INVITE this session answers, if it is a terminating session.
    pub fn invite(&self) -> Option<&Request> {
        self.invite.as_ref()
    }

    pub fn transaction_timeout(&self) -> Duration {
        self.transaction_timeout
    }

    pub fn invitation_status(&self) -> InvitationStatus {
        self.invitation.borrow().status
    }

    pub fn set_sig_established(&self) {
        self.dialog.lock().expect("lock failed").set_sig_established();
    }

    pub fn set_local_content(&self, sdp: impl Into<String>) {
        *self.local_content.lock().expect("lock failed") = Some(sdp.into());
    }

    pub fn local_content(&self) -> Option<String> {
        self.local_content.lock().expect("lock failed").clone()
    }

    /// Records the local accept decision and releases waiters.
    ///
    /// A second call, or a call after `reject_session`, is a no-op: the race
    /// between a deferred UI event and the ringing timer is legitimate.
    pub fn accept_session(&self) {
        let changed = self.invitation.send_if_modified(|state| {
            if state.status == InvitationStatus::NotAnswered {
                state.status = InvitationStatus::Accepted;
                true
            } else {
                false
            }
        });
        if !changed {
            log::debug!("session {}: accept ignored, already answered", self.id);
        }
    }

    /// Records the local reject decision, answers the INVITE with 603 and
    /// removes the session from its service's table. No-op once answered.
    pub async fn reject_session(&self) {
        let changed = self.invitation.send_if_modified(|state| {
            if state.status == InvitationStatus::NotAnswered {
                state.status = InvitationStatus::Rejected;
                true
            } else {
                false
            }
        });
        if !changed {
            log::debug!("session {}: reject ignored, already answered", self.id);
            return;
        }

        self.send_603_decline().await;
        self.table.remove(&self.call_id());
    }

    /// Waits until the invitation is answered or the ringing period elapses.
    ///
    /// A timeout returns `NotAnswered` without mutating state: deciding
    /// whether a silent timeout counts as a rejection is the caller's call.
    pub async fn wait_invitation_answer(&self) -> InvitationStatus {
        let mut rx = self.invitation.subscribe();
        let answered = rx.wait_for(|state| {
            state.terminated || state.status != InvitationStatus::NotAnswered
        });
        let status = match tokio::time::timeout(self.ringing_period, answered).await {
            Ok(Ok(state)) => state.status,
            // Timer fired, or the watch sender is gone with the session.
            _ => InvitationStatus::NotAnswered,
        };
        status
    }

    /// Ends the session: BYE when the dialog is established, CANCEL when the
    /// initial transaction never completed. Never fails; network errors on
    /// the way out are logged and the dialog is marked ended regardless.
    pub async fn terminate_session(&self) {
        self.invitation.send_modify(|state| state.terminated = true);

        let prepared = {
            let mut dialog = self.dialog.lock().expect("lock failed");
            if dialog.is_session_terminated() || dialog.is_session_cancelled() {
                None
            } else if dialog.is_sig_established() {
                dialog.increment_cseq();
                let request = dialog.make_request(Method::Bye);
                dialog.set_session_terminated();
                request.ok()
            } else {
                // CANCEL targets the pending INVITE transaction and must
                // mirror its CSeq.
                let request = dialog.make_request(Method::Cancel);
                dialog.set_session_cancelled();
                request.ok()
            }
        };

        if let Some(mut request) = prepared {
            self.auth
                .lock()
                .expect("lock failed")
                .set_proxy_authorization_header(&mut request);
            let method = request.method.clone();
            log::debug!("session {}: terminating with {}", self.id, method);

            match self.sip.send_and_wait(request.into()).await {
                Ok(ctx) => {
                    ctx.wait_response(self.transaction_timeout).await;
                    if !ctx.is_response_received() {
                        log::warn!("session {}: no response to {}", self.id, method);
                    }
                }
                Err(err) => {
                    log::warn!("session {}: failed to send {}: {}", self.id, method, err)
                }
            }
        }

        self.table.remove(&self.call_id());
    }

    /// Constructs and sends the ACK for a final response. The ACK shares the
    /// INVITE's CSeq, so the counter is left untouched.
    pub async fn send_ack(&self) {
        let request = self
            .dialog
            .lock()
            .expect("lock failed")
            .make_request(Method::Ack);
        match request {
            Ok(ack) => self.send_message(ack.into()).await,
            Err(err) => log::warn!("session {}: cannot build ACK: {}", self.id, err),
        }
    }

    /// Builds a response to the stored INVITE. `None` for originating
    /// sessions, which have no INVITE to answer.
    pub fn build_invite_response(&self, status_code: u16, reason: &str) -> Option<Response> {
        let invite = self.invite.as_ref()?;
        let local_tag = self
            .dialog
            .lock()
            .expect("lock failed")
            .local_tag()
            .to_string();
        Some(message::response_to(
            invite,
            status_code,
            reason,
            Some(&local_tag),
        ))
    }

    pub async fn send_180_ringing(&self) {
        match self.build_invite_response(180, "Ringing") {
            Some(response) => self.send_message(response.into()).await,
            None => log::warn!("session {}: no INVITE to ring against", self.id),
        }
    }

    pub async fn send_603_decline(&self) {
        match self.build_invite_response(603, "Decline") {
            Some(response) => self.send_message(response.into()).await,
            None => log::warn!("session {}: no INVITE to decline", self.id),
        }
    }

    pub async fn send_405_error(&self, request: &Request) {
        self.send_response(request, 405, "Method Not Allowed").await;
    }

    pub async fn send_415_error(&self, request: &Request) {
        self.send_response(request, 415, "Unsupported Media Type").await;
    }

    /// Answers an in-dialog request. Send failures are logged and swallowed:
    /// there is no corrective action mid-handshake.
    pub async fn send_response(&self, request: &Request, status_code: u16, reason: &str) {
        let local_tag = self
            .dialog
            .lock()
            .expect("lock failed")
            .local_tag()
            .to_string();
        let response = message::response_to(request, status_code, reason, Some(&local_tag));
        self.send_message(response.into()).await;
    }

    /// Fire-and-forget send with log-and-swallow error handling.
    pub async fn send_message(&self, message: SipMessage) {
        if let Err(err) = self.sip.send(message).await {
            log::warn!("session {}: send failed: {}", self.id, err);
        }
    }

    fn wake_waiters(&self) {
        self.invitation.send_modify(|state| state.terminated = true);
    }
}

/// Per-kind behavior of a session.
///
/// The dispatcher routes subsequent in-dialog requests through these hooks.
/// Kinds that do not support an operation keep the default, which still
/// answers the request instead of leaving it hanging.
#[async_trait::async_trait]
pub trait SessionHandler: Send + Sync + 'static {
    fn core(&self) -> &SessionCore;

    /// The session's worker. Runs once, on the session's own task.
    async fn run(self: Arc<Self>);

    /// Registers the session in its service's table and spawns the worker.
    fn start_session(self: Arc<Self>)
    where
        Self: Sized,
    {
        let handler: Arc<dyn SessionHandler> = self.clone();
        self.core().table.add(handler);
        log::debug!("session {}: started", self.core().id());
        tokio::spawn(self.run());
    }

    /// Hook run when the remote side ends the session; media teardown
    /// belongs here.
    fn on_session_ended(&self) {}

    async fn abort_session(&self) {
        self.on_session_ended();
        self.core().terminate_session().await;
    }

    async fn receive_re_invite(&self, request: Request) {
        self.core().send_405_error(&request).await;
    }

    async fn receive_update(&self, request: Request) {
        self.core().send_405_error(&request).await;
    }

    async fn receive_bye(&self, request: Request) {
        let core = self.core();
        log::info!("session {}: remote BYE", core.id());
        core.send_response(&request, 200, "OK").await;
        core.dialog
            .lock()
            .expect("lock failed")
            .set_session_terminated();
        core.wake_waiters();
        self.on_session_ended();
        core.table.remove(&core.call_id());
    }

    async fn receive_cancel(&self, request: Request) {
        let core = self.core();
        log::info!("session {}: remote CANCEL", core.id());
        core.send_response(&request, 200, "OK").await;
        if core.invitation_status() == InvitationStatus::NotAnswered {
            if let Some(response) = core.build_invite_response(487, "Request Terminated") {
                core.send_message(response.into()).await;
            }
        }
        core.dialog
            .lock()
            .expect("lock failed")
            .set_session_cancelled();
        core.wake_waiters();
        self.on_session_ended();
        core.table.remove(&core.call_id());
    }
}

/// Time-based identifier, unique enough within one process lifetime.
fn generate_session_id() -> u64 {
    static COUNTER: AtomicU64 = AtomicU64::new(0);
    let millis = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64;
    millis.wrapping_add(COUNTER.fetch_add(1, Ordering::Relaxed))
}
