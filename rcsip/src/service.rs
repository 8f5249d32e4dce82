//! Per-feature IMS services and their terminating sessions.
//!
//! Each service owns a session table; the dispatcher consults the registry
//! to find an existing session by Call-ID or to hand a classified INVITE to
//! the right service.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::auth::UserCredentials;
use crate::message::{self, Request};
use crate::msrp::session::MsrpSession;
use crate::session::{
    InvitationStatus, SessionContext, SessionCore, SessionHandler, SessionTable,
};
use crate::transport::SipManager;

/// Surface common to all five services.
pub trait ImsService: Send + Sync + 'static {
    fn name(&self) -> &'static str;
    fn is_activated(&self) -> bool;
    fn set_activated(&self, activated: bool);
    fn sessions(&self) -> &Arc<SessionTable>;
}

/// The five per-feature services of one stack instance.
pub struct ServiceRegistry {
    pub capability: Arc<CapabilityService>,
    pub im: Arc<InstantMessagingService>,
    pub content_sharing: Arc<ContentSharingService>,
    pub presence: Arc<PresenceService>,
    pub call: Arc<SipCallService>,
}

impl ServiceRegistry {
    pub fn new(
        sip: Arc<dyn SipManager>,
        credentials: UserCredentials,
        ringing_period: Duration,
        transaction_timeout: Duration,
    ) -> Arc<ServiceRegistry> {
        let ctx = |table: Arc<SessionTable>| SessionContext {
            sip: sip.clone(),
            table,
            credentials: credentials.clone(),
            ringing_period,
            transaction_timeout,
        };
        Arc::new(ServiceRegistry {
            capability: CapabilityService::new(ctx(SessionTable::new())),
            im: InstantMessagingService::new(ctx(SessionTable::new())),
            content_sharing: ContentSharingService::new(ctx(SessionTable::new())),
            presence: PresenceService::new(ctx(SessionTable::new())),
            call: SipCallService::new(ctx(SessionTable::new())),
        })
    }

    pub fn all(&self) -> [&dyn ImsService; 5] {
        [
            self.capability.as_ref(),
            self.im.as_ref(),
            self.content_sharing.as_ref(),
            self.presence.as_ref(),
            self.call.as_ref(),
        ]
    }

    /// Finds a live session by Call-ID across every service's table.
    pub fn find_session(&self, call_id: &str) -> Option<Arc<dyn SessionHandler>> {
        self.all()
            .iter()
            .find_map(|service| service.sessions().find(call_id))
    }

    /// Aborts every live session, used on stack shutdown.
    pub async fn abort_all(&self) {
        for service in self.all() {
            for session in service.sessions().all() {
                session.abort_session().await;
            }
        }
    }
}

/// Answers a request outside any session, with a fresh local tag.
async fn answer(sip: &Arc<dyn SipManager>, request: &Request, status_code: u16, reason: &str) {
    let tag = message::generate_tag();
    let response = message::response_to(request, status_code, reason, Some(&tag));
    if let Err(err) = sip.send(response.into()).await {
        log::warn!("failed to answer {} with {}: {}", request.method, status_code, err);
    }
}

/// Rings, waits for the local answer, and completes the handshake.
///
/// An accepted invitation gets the 200 OK carrying whatever SDP answer the
/// media layer attached; the dialog is then established. A timeout proceeds
/// to termination, which becomes a CANCEL since nothing was established.
async fn ring_and_answer(core: &SessionCore) -> InvitationStatus {
    core.send_180_ringing().await;
    let answer = core.wait_invitation_answer().await;
    match answer {
        InvitationStatus::Accepted => {
            if let Some(mut ok) = core.build_invite_response(200, "OK") {
                if let Some(sdp) = core.local_content() {
                    ok.headers.push("Content-Type", "application/sdp");
                    ok.body = Some(sdp);
                }
                core.send_message(ok.into()).await;
                core.set_sig_established();
            }
        }
        // The reject path already sent the 603 and cleaned the table.
        InvitationStatus::Rejected => {}
        InvitationStatus::NotAnswered => {
            log::info!("session {}: invitation not answered in time", core.id());
            core.terminate_session().await;
        }
    }
    answer
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessagingKind {
    OneToOneChat,
    AdhocGroupChat,
    FileTransfer,
    LargeMessage,
}

impl MessagingKind {
    fn label(self) -> &'static str {
        match self {
            MessagingKind::OneToOneChat => "1-1 chat",
            MessagingKind::AdhocGroupChat => "ad-hoc group chat",
            MessagingKind::FileTransfer => "file transfer",
            MessagingKind::LargeMessage => "large-message IM",
        }
    }
}

/// MSRP-backed messaging session (chat, file transfer, large message).
pub struct MessagingSession {
    core: SessionCore,
    kind: MessagingKind,
    media: Mutex<Option<Arc<MsrpSession>>>,
}

impl MessagingSession {
    pub fn terminating(
        ctx: SessionContext,
        invite: Request,
        kind: MessagingKind,
    ) -> crate::Result<Arc<Self>> {
        Ok(Arc::new(MessagingSession {
            core: SessionCore::terminating(ctx, invite)?,
            kind,
            media: Mutex::new(None),
        }))
    }

    pub fn kind(&self) -> MessagingKind {
        self.kind
    }

    /// Hands over the negotiated MSRP session once the SDP answer is fixed.
    pub fn attach_media(&self, media: Arc<MsrpSession>) {
        *self.media.lock().expect("lock failed") = Some(media);
    }

    pub fn media(&self) -> Option<Arc<MsrpSession>> {
        self.media.lock().expect("lock failed").clone()
    }
}

#[async_trait::async_trait]
impl SessionHandler for MessagingSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_session_ended(&self) {
        if let Some(media) = self.media.lock().expect("lock failed").take() {
            media.close();
        }
    }

    async fn run(self: Arc<Self>) {
        log::info!(
            "session {}: {} invitation from {}",
            self.core.id(),
            self.kind.label(),
            self.core.remote_contact()
        );
        ring_and_answer(&self.core).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SharingKind {
    Image,
    Video,
}

/// Content-sharing session piggybacked on an established call.
pub struct SharingSession {
    core: SessionCore,
    kind: SharingKind,
    media: Mutex<Option<Arc<MsrpSession>>>,
}

impl SharingSession {
    pub fn terminating(
        ctx: SessionContext,
        invite: Request,
        kind: SharingKind,
    ) -> crate::Result<Arc<Self>> {
        Ok(Arc::new(SharingSession {
            core: SessionCore::terminating(ctx, invite)?,
            kind,
            media: Mutex::new(None),
        }))
    }

    pub fn kind(&self) -> SharingKind {
        self.kind
    }

    /// Image sharing carries its payload over MSRP; video streams over RTP
    /// and never attaches one.
    pub fn attach_media(&self, media: Arc<MsrpSession>) {
        *self.media.lock().expect("lock failed") = Some(media);
    }
}

#[async_trait::async_trait]
impl SessionHandler for SharingSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_session_ended(&self) {
        if let Some(media) = self.media.lock().expect("lock failed").take() {
            media.close();
        }
    }

    async fn run(self: Arc<Self>) {
        let label = match self.kind {
            SharingKind::Image => "image sharing",
            SharingKind::Video => "video sharing",
        };
        log::info!(
            "session {}: {} invitation from {}",
            self.core.id(),
            label,
            self.core.remote_contact()
        );
        ring_and_answer(&self.core).await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Voice,
    Text,
}

pub struct CallSession {
    core: SessionCore,
    kind: CallKind,
}

impl CallSession {
    pub fn terminating(
        ctx: SessionContext,
        invite: Request,
        kind: CallKind,
    ) -> crate::Result<Arc<Self>> {
        Ok(Arc::new(CallSession {
            core: SessionCore::terminating(ctx, invite)?,
            kind,
        }))
    }

    pub fn kind(&self) -> CallKind {
        self.kind
    }
}

#[async_trait::async_trait]
impl SessionHandler for CallSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    async fn run(self: Arc<Self>) {
        let label = match self.kind {
            CallKind::Voice => "voice call",
            CallKind::Text => "text call",
        };
        log::info!(
            "session {}: {} invitation from {}",
            self.core.id(),
            label,
            self.core.remote_contact()
        );
        ring_and_answer(&self.core).await;
    }
}

macro_rules! ims_service {
    ($ty:ident, $name:literal) => {
        impl ImsService for $ty {
            fn name(&self) -> &'static str {
                $name
            }

            fn is_activated(&self) -> bool {
                self.activated.load(Ordering::SeqCst)
            }

            fn set_activated(&self, activated: bool) {
                self.activated.store(activated, Ordering::SeqCst);
            }

            fn sessions(&self) -> &Arc<SessionTable> {
                &self.ctx.table
            }
        }
    };
}

/// Capability discovery (OPTIONS exchange).
pub struct CapabilityService {
    ctx: SessionContext,
    activated: AtomicBool,
}

impl CapabilityService {
    fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(CapabilityService {
            ctx,
            activated: AtomicBool::new(true),
        })
    }

    /// Answers a capability query from a remote contact.
    pub async fn receive_capability_request(&self, request: Request) {
        log::debug!(
            "capability request from {}",
            request.from_uri().unwrap_or_default()
        );
        answer(&self.ctx.sip, &request, 200, "OK").await;
    }
}

ims_service!(CapabilityService, "capability");

/// Instant messaging: pager messages plus MSRP chat and file transfer.
pub struct InstantMessagingService {
    ctx: SessionContext,
    activated: AtomicBool,
}

impl InstantMessagingService {
    fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(InstantMessagingService {
            ctx,
            activated: AtomicBool::new(true),
        })
    }

    /// Pager-mode MESSAGE, outside any session.
    pub async fn receive_message(&self, request: Request) {
        log::info!(
            "pager message from {}",
            request.from_uri().unwrap_or_default()
        );
        answer(&self.ctx.sip, &request, 200, "OK").await;
    }

    pub async fn receive_one_to_one_chat_invitation(&self, invite: Request) {
        self.start(MessagingKind::OneToOneChat, invite);
    }

    pub async fn receive_adhoc_group_chat_invitation(&self, invite: Request) {
        self.start(MessagingKind::AdhocGroupChat, invite);
    }

    pub async fn receive_file_transfer_invitation(&self, invite: Request) {
        self.start(MessagingKind::FileTransfer, invite);
    }

    pub async fn receive_large_message_invitation(&self, invite: Request) {
        self.start(MessagingKind::LargeMessage, invite);
    }

    fn start(&self, kind: MessagingKind, invite: Request) {
        match MessagingSession::terminating(self.ctx.clone(), invite, kind) {
            Ok(session) => session.start_session(),
            Err(err) => log::warn!("cannot create {} session: {}", kind.label(), err),
        }
    }
}

ims_service!(InstantMessagingService, "instant-messaging");

/// Image and video sharing during a call.
pub struct ContentSharingService {
    ctx: SessionContext,
    activated: AtomicBool,
}

impl ContentSharingService {
    fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(ContentSharingService {
            ctx,
            activated: AtomicBool::new(true),
        })
    }

    pub async fn receive_image_sharing_invitation(&self, invite: Request) {
        self.start(SharingKind::Image, invite).await;
    }

    pub async fn receive_video_sharing_invitation(&self, invite: Request) {
        self.start(SharingKind::Video, invite).await;
    }

    async fn start(&self, kind: SharingKind, invite: Request) {
        // One sharing session at a time per direction.
        if !self.ctx.table.is_empty() {
            log::info!("content sharing busy, refusing new invitation");
            answer(&self.ctx.sip, &invite, 486, "Busy Here").await;
            return;
        }
        match SharingSession::terminating(self.ctx.clone(), invite, kind) {
            Ok(session) => session.start_session(),
            Err(err) => log::warn!("cannot create sharing session: {}", err),
        }
    }
}

ims_service!(ContentSharingService, "content-sharing");

/// Presence watching (NOTIFY intake).
pub struct PresenceService {
    ctx: SessionContext,
    activated: AtomicBool,
}

impl PresenceService {
    fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(PresenceService {
            ctx,
            activated: AtomicBool::new(true),
        })
    }

    pub async fn receive_notification(&self, request: Request) {
        log::debug!(
            "presence notification from {}",
            request.from_uri().unwrap_or_default()
        );
        answer(&self.ctx.sip, &request, 200, "OK").await;
    }
}

ims_service!(PresenceService, "presence");

/// IMS voice/text calls.
pub struct SipCallService {
    ctx: SessionContext,
    activated: AtomicBool,
}

impl SipCallService {
    fn new(ctx: SessionContext) -> Arc<Self> {
        Arc::new(SipCallService {
            ctx,
            activated: AtomicBool::new(true),
        })
    }

    pub async fn receive_voice_call_invitation(&self, invite: Request) {
        self.start(CallKind::Voice, invite);
    }

    pub async fn receive_text_call_invitation(&self, invite: Request) {
        self.start(CallKind::Text, invite);
    }

    fn start(&self, kind: CallKind, invite: Request) {
        match CallSession::terminating(self.ctx.clone(), invite, kind) {
            Ok(session) => session.start_session(),
            Err(err) => log::warn!("cannot create call session: {}", err),
        }
    }
}

ims_service!(SipCallService, "sip-call");
