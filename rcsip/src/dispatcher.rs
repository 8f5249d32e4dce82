//! Inbound request dispatch.
//!
//! A single worker task drains the inbound FIFO. Each request either joins
//! an existing dialog, found by Call-ID across every service's table, or is
//! classified by its SDP offer and feature tags and handed to a service as
//! a new invitation.

use std::sync::{Arc, Mutex};

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::message::{self, Method, Request};
use crate::service::{ImsService, ServiceRegistry};
use crate::transport::SipManager;

/// Answers "is there an established call with this remote party right now",
/// for the sharing features that piggyback on a call leg.
pub trait CallMonitor: Send + Sync + 'static {
    fn is_connected(&self, remote: &str) -> bool;
}

/// External notification path for INVITEs, e.g. third-party plugins.
pub trait IntentBroadcaster: Send + Sync + 'static {
    /// Returns true when some external consumer resolved the invitation.
    fn broadcast_invite(&self, request: &Request) -> bool;
}

/// Default hooks for stacks without telephony or plugin integration.
pub struct NoCallMonitor;

impl CallMonitor for NoCallMonitor {
    fn is_connected(&self, _remote: &str) -> bool {
        false
    }
}

pub struct NoIntentBroadcaster;

impl IntentBroadcaster for NoIntentBroadcaster {
    fn broadcast_invite(&self, _request: &Request) -> bool {
        false
    }
}

/// Where a classified INVITE goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InviteTarget {
    VideoSharing,
    ImageSharing,
    FileTransfer,
    LargeMessageMode,
    AdhocGroupChat,
    OneToOneChat,
    VoiceCall,
    TextCall,
}

impl InviteTarget {
    /// Sharing features ride on an already-established call leg.
    pub fn requires_call_leg(self) -> bool {
        matches!(self, InviteTarget::VideoSharing | InviteTarget::ImageSharing)
    }
}

/// Ordered rules: (media marker, feature-tag substring, extra SDP marker).
/// The first match wins; the order itself is the tie-break policy.
const CLASSIFICATION_RULES: &[(&str, &str, &str, InviteTarget)] = &[
    ("rtp", "3gpp.cs-voice", "", InviteTarget::VideoSharing),
    (
        "msrp",
        "3gpp-application.ims.iari.gsma-is",
        "",
        InviteTarget::ImageSharing,
    ),
    ("msrp", "g.oma.sip-im", "file-selector", InviteTarget::FileTransfer),
    (
        "msrp",
        "g.oma.sip-im.large-message",
        "",
        InviteTarget::LargeMessageMode,
    ),
    ("msrp", "g.oma.sip-im", "message/cpim", InviteTarget::AdhocGroupChat),
    ("msrp", "g.oma.sip-im", "", InviteTarget::OneToOneChat),
    ("rtp", "", "m=audio", InviteTarget::VoiceCall),
    ("rtp", "", "m=text", InviteTarget::TextCall),
];

/// Feature tags live in the first of these headers that is present.
const FEATURE_TAG_HEADERS: &[&str] = &["Accept-Contact", "a", "Contact", "m"];

/// Classifies an INVITE by substring-matching its SDP offer and feature
/// tags against the rule table. Pure: same input, same rule, always.
pub fn classify_invite(request: &Request) -> Option<InviteTarget> {
    let sdp = request
        .body
        .as_deref()
        .unwrap_or_default()
        .to_ascii_lowercase();
    let feature_tags = FEATURE_TAG_HEADERS
        .iter()
        .find_map(|name| request.headers.get(name))
        .unwrap_or_default()
        .to_ascii_lowercase();

    CLASSIFICATION_RULES
        .iter()
        .find(|(media, tag, marker, _)| {
            sdp.contains(media)
                && (tag.is_empty() || feature_tags.contains(tag))
                && (marker.is_empty() || sdp.contains(marker))
        })
        .map(|&(_, _, _, target)| target)
}

struct Worker {
    sip: Arc<dyn SipManager>,
    services: Arc<ServiceRegistry>,
    call_monitor: Arc<dyn CallMonitor>,
    intents: Arc<dyn IntentBroadcaster>,
}

pub struct ImsServiceDispatcher {
    tx: Mutex<Option<mpsc::UnboundedSender<Request>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl ImsServiceDispatcher {
    /// Spawns the worker; it lives until [`close`](Self::close).
    pub fn start(
        sip: Arc<dyn SipManager>,
        services: Arc<ServiceRegistry>,
        call_monitor: Arc<dyn CallMonitor>,
        intents: Arc<dyn IntentBroadcaster>,
    ) -> ImsServiceDispatcher {
        let (tx, mut rx) = mpsc::unbounded_channel::<Request>();
        let worker = Worker {
            sip,
            services,
            call_monitor,
            intents,
        };
        let handle = tokio::spawn(async move {
            while let Some(request) = rx.recv().await {
                worker.dispatch(request).await;
            }
            log::debug!("dispatcher: queue closed, worker exiting");
        });
        ImsServiceDispatcher {
            tx: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        }
    }

    /// Enqueues an inbound request; never blocks the network task.
    pub fn post_request(&self, request: Request) {
        let tx = self.tx.lock().expect("lock failed");
        match tx.as_ref() {
            Some(tx) => {
                if tx.send(request).is_err() {
                    log::warn!("dispatcher: worker gone, request dropped");
                }
            }
            None => log::warn!("dispatcher: closed, request dropped"),
        }
    }

    /// Closes the queue; the worker drains what is left and exits.
    pub async fn close(&self) {
        self.tx.lock().expect("lock failed").take();
        let handle = self.handle.lock().expect("lock failed").take();
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                log::warn!("dispatcher: worker ended abnormally: {}", err);
            }
        }
    }
}

impl Worker {
    async fn dispatch(&self, request: Request) {
        let Some(call_id) = request.call_id().map(str::to_string) else {
            log::warn!("dispatcher: request without Call-ID dropped");
            return;
        };
        log::trace!("dispatcher: {} for call {}", request.method, call_id);

        // In-dialog requests go straight to their session.
        if let Some(session) = self.services.find_session(&call_id) {
            match request.method {
                Method::Update => session.receive_update(request).await,
                Method::Bye => session.receive_bye(request).await,
                Method::Cancel => session.receive_cancel(request).await,
                Method::Invite => session.receive_re_invite(request).await,
                // Lenient fallback: unknown subsequent methods are dropped
                // without a response.
                ref other => {
                    log::debug!("dispatcher: unhandled {} within call {}", other, call_id)
                }
            }
            return;
        }

        match request.method {
            Method::Message => {
                if self.services.im.is_activated() {
                    self.services.im.receive_message(request).await;
                } else {
                    log::debug!("dispatcher: IM deactivated, MESSAGE dropped");
                }
            }
            Method::Notify => {
                if self.services.presence.is_activated() {
                    self.services.presence.receive_notification(request).await;
                } else {
                    log::debug!("dispatcher: presence deactivated, NOTIFY dropped");
                }
            }
            Method::Options => {
                if self.services.capability.is_activated() {
                    self.services
                        .capability
                        .receive_capability_request(request)
                        .await;
                } else {
                    log::debug!("dispatcher: capability deactivated, OPTIONS dropped");
                }
            }
            Method::Invite => self.dispatch_invite(request).await,
            ref other => log::debug!("dispatcher: {} outside any call dropped", other),
        }
    }

    async fn dispatch_invite(&self, request: Request) {
        // Stop client retransmissions before doing any work.
        self.answer(&request, 100, "Trying", None).await;

        let Some(target) = classify_invite(&request) else {
            log::info!("dispatcher: unclassifiable INVITE");
            if !self.intents.broadcast_invite(&request) {
                self.answer_final(&request, 606, "Not Acceptable").await;
            }
            return;
        };
        log::debug!("dispatcher: INVITE classified as {:?}", target);

        if target.requires_call_leg() {
            let from = request.from_uri().unwrap_or_default();
            if !self.call_monitor.is_connected(&from) {
                log::info!("dispatcher: no call leg with {}, refusing {:?}", from, target);
                self.answer_final(&request, 606, "Not Acceptable").await;
                return;
            }
        }

        let services = &self.services;
        match target {
            InviteTarget::VideoSharing => {
                services
                    .content_sharing
                    .receive_video_sharing_invitation(request.clone())
                    .await
            }
            InviteTarget::ImageSharing => {
                services
                    .content_sharing
                    .receive_image_sharing_invitation(request.clone())
                    .await
            }
            InviteTarget::FileTransfer => {
                services
                    .im
                    .receive_file_transfer_invitation(request.clone())
                    .await
            }
            InviteTarget::LargeMessageMode => {
                services
                    .im
                    .receive_large_message_invitation(request.clone())
                    .await
            }
            InviteTarget::AdhocGroupChat => {
                services
                    .im
                    .receive_adhoc_group_chat_invitation(request.clone())
                    .await
            }
            InviteTarget::OneToOneChat => {
                services
                    .im
                    .receive_one_to_one_chat_invitation(request.clone())
                    .await
            }
            InviteTarget::VoiceCall => {
                services
                    .call
                    .receive_voice_call_invitation(request.clone())
                    .await
            }
            InviteTarget::TextCall => {
                services
                    .call
                    .receive_text_call_invitation(request.clone())
                    .await
            }
        }

        // Secondary notification path, kept even for routed INVITEs.
        self.intents.broadcast_invite(&request);
    }

    async fn answer_final(&self, request: &Request, status_code: u16, reason: &str) {
        let tag = message::generate_tag();
        self.answer(request, status_code, reason, Some(&tag)).await;
    }

    async fn answer(&self, request: &Request, status_code: u16, reason: &str, tag: Option<&str>) {
        let response = message::response_to(request, status_code, reason, tag);
        if let Err(err) = self.sip.send(response.into()).await {
            log::warn!("dispatcher: failed to send {}: {}", status_code, err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::auth::UserCredentials;
    use crate::transport::mock::MockSipManager;

    fn invite_with(feature_tags: &str, sdp: &str) -> Request {
        let mut req = Request::new(Method::Invite, "sip:bob@example.com");
        req.headers.push("Call-ID", "call-cls");
        req.headers.push("From", "<sip:alice@example.com>;tag=r1");
        req.headers.push("To", "<sip:bob@example.com>");
        req.headers.push("Contact", "<sip:alice@10.0.0.1:5060>");
        req.headers.push("CSeq", "1 INVITE");
        if !feature_tags.is_empty() {
            req.headers.push("Accept-Contact", feature_tags);
        }
        req.body = Some(sdp.to_string());
        req
    }

    fn chat_sdp() -> &'static str {
        "v=0\r\nm=message 2855 TCP/MSRP *\r\na=path:msrp://10.0.0.1:2855/s1;tcp\r\n"
    }

    #[test]
    fn chat_invite_classifies_as_one_to_one() {
        let req = invite_with("*;+g.oma.sip-im", chat_sdp());
        assert_eq!(classify_invite(&req), Some(InviteTarget::OneToOneChat));
    }

    #[test]
    fn file_selector_wins_over_plain_chat() {
        let sdp = format!("{}a=file-selector:name:\"x.jpg\"\r\n", chat_sdp());
        let req = invite_with("*;+g.oma.sip-im", &sdp);
        assert_eq!(classify_invite(&req), Some(InviteTarget::FileTransfer));
    }

    #[test]
    fn cpim_marker_selects_group_chat() {
        let sdp = format!("{}a=accept-types:message/cpim\r\n", chat_sdp());
        let req = invite_with("*;+g.oma.sip-im", &sdp);
        assert_eq!(classify_invite(&req), Some(InviteTarget::AdhocGroupChat));
    }

    #[test]
    fn large_message_tag_selects_large_mode() {
        let req = invite_with("*;+g.oma.sip-im.large-message", chat_sdp());
        assert_eq!(classify_invite(&req), Some(InviteTarget::LargeMessageMode));
    }

    #[test]
    fn image_share_and_video_share_classify() {
        let image = invite_with(
            "*;+g.3gpp-application.ims.iari.gsma-is",
            "m=message 2855 TCP/MSRP *\r\n",
        );
        assert_eq!(classify_invite(&image), Some(InviteTarget::ImageSharing));

        let video = invite_with("*;+g.3gpp.cs-voice", "m=video 5006 RTP/AVP 96\r\n");
        assert_eq!(classify_invite(&video), Some(InviteTarget::VideoSharing));
    }

    #[test]
    fn rtp_media_lines_select_calls() {
        let voice = invite_with("", "m=audio 49170 RTP/AVP 0\r\n");
        assert_eq!(classify_invite(&voice), Some(InviteTarget::VoiceCall));

        let text = invite_with("", "m=text 11000 RTP/AVP 98\r\n");
        assert_eq!(classify_invite(&text), Some(InviteTarget::TextCall));
    }

    #[test]
    fn classification_is_deterministic() {
        let req = invite_with("*;+g.oma.sip-im", chat_sdp());
        let first = classify_invite(&req);
        for _ in 0..10 {
            assert_eq!(classify_invite(&req), first);
        }
    }

    #[test]
    fn unmatchable_offer_classifies_as_none() {
        let req = invite_with("", "m=application 9 UDP/DTLS 0\r\n");
        assert_eq!(classify_invite(&req), None);
    }

    struct ConnectedCall;
    impl CallMonitor for ConnectedCall {
        fn is_connected(&self, _remote: &str) -> bool {
            true
        }
    }

    fn start_dispatcher(
        sip: Arc<MockSipManager>,
        call_monitor: Arc<dyn CallMonitor>,
    ) -> (ImsServiceDispatcher, Arc<ServiceRegistry>) {
        let services = ServiceRegistry::new(
            sip.clone(),
            UserCredentials::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let dispatcher = ImsServiceDispatcher::start(
            sip,
            services.clone(),
            call_monitor,
            Arc::new(NoIntentBroadcaster),
        );
        (dispatcher, services)
    }

    async fn dispatch_one(
        sip: Arc<MockSipManager>,
        call_monitor: Arc<dyn CallMonitor>,
        request: Request,
    ) -> Arc<ServiceRegistry> {
        let services = ServiceRegistry::new(
            sip.clone(),
            UserCredentials::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let dispatcher = ImsServiceDispatcher::start(
            sip,
            services.clone(),
            call_monitor,
            Arc::new(NoIntentBroadcaster),
        );
        dispatcher.post_request(request);
        dispatcher.close().await;
        services
    }

    #[tokio::test]
    async fn chat_invite_reaches_the_im_service() {
        let sip = Arc::new(MockSipManager::new());
        let req = invite_with("*;+g.oma.sip-im", chat_sdp());
        let services = dispatch_one(sip.clone(), Arc::new(NoCallMonitor), req).await;

        // 100 Trying first, then a session ringing on the IM table.
        assert_eq!(sip.sent_response_codes()[0], 100);
        assert_eq!(services.im.sessions().len(), 1);
    }

    #[tokio::test]
    async fn image_share_without_call_leg_is_refused() {
        let sip = Arc::new(MockSipManager::new());
        let req = invite_with(
            "*;+g.3gpp-application.ims.iari.gsma-is",
            "m=message 2855 TCP/MSRP *\r\n",
        );
        let services = dispatch_one(sip.clone(), Arc::new(NoCallMonitor), req).await;

        assert_eq!(sip.sent_response_codes(), [100, 606]);
        assert!(services.content_sharing.sessions().is_empty());
    }

    #[tokio::test]
    async fn image_share_with_call_leg_reaches_content_sharing() {
        let sip = Arc::new(MockSipManager::new());
        let req = invite_with(
            "*;+g.3gpp-application.ims.iari.gsma-is",
            "m=message 2855 TCP/MSRP *\r\n",
        );
        let services = dispatch_one(sip.clone(), Arc::new(ConnectedCall), req).await;

        assert_eq!(sip.sent_response_codes(), [100]);
        assert_eq!(services.content_sharing.sessions().len(), 1);
    }

    #[tokio::test]
    async fn unclassifiable_invite_gets_606() {
        let sip = Arc::new(MockSipManager::new());
        let req = invite_with("", "m=application 9 UDP/DTLS 0\r\n");
        dispatch_one(sip.clone(), Arc::new(NoCallMonitor), req).await;

        assert_eq!(sip.sent_response_codes(), [100, 606]);
    }

    #[tokio::test]
    async fn in_dialog_bye_routes_to_the_session() {
        let sip = Arc::new(MockSipManager::new());
        let services = ServiceRegistry::new(
            sip.clone(),
            UserCredentials::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let dispatcher = ImsServiceDispatcher::start(
            sip.clone(),
            services.clone(),
            Arc::new(NoCallMonitor),
            Arc::new(NoIntentBroadcaster),
        );

        // Establish a chat session first.
        let invite = invite_with("*;+g.oma.sip-im", chat_sdp());
        dispatcher.post_request(invite.clone());

        let mut bye = invite;
        bye.method = Method::Bye;
        dispatcher.post_request(bye);
        dispatcher.close().await;

        assert!(services.im.sessions().is_empty());
        // 100 Trying for the INVITE, 200 OK for the BYE; the 180 from the
        // ringing task may interleave.
        let codes = sip.sent_response_codes();
        assert!(codes.contains(&100));
        assert!(codes.contains(&200));
    }

    #[tokio::test]
    async fn unknown_in_dialog_method_is_dropped_silently() {
        let sip = Arc::new(MockSipManager::new());
        let services = ServiceRegistry::new(
            sip.clone(),
            UserCredentials::default(),
            Duration::from_secs(30),
            Duration::from_secs(5),
        );
        let dispatcher = ImsServiceDispatcher::start(
            sip.clone(),
            services.clone(),
            Arc::new(NoCallMonitor),
            Arc::new(NoIntentBroadcaster),
        );

        let invite = invite_with("*;+g.oma.sip-im", chat_sdp());
        dispatcher.post_request(invite.clone());

        let mut refer = invite;
        refer.method = Method::Other("REFER".into());
        dispatcher.post_request(refer);
        dispatcher.close().await;

        // Only the 100 Trying (and possibly the 180) went out; nothing was
        // sent for the REFER.
        assert!(sip.sent_response_codes().iter().all(|&c| c == 100 || c == 180));
    }

    #[tokio::test]
    async fn bye_for_unknown_call_is_dropped() {
        let sip = Arc::new(MockSipManager::new());
        let mut bye = invite_with("", "");
        bye.method = Method::Bye;
        dispatch_one(sip.clone(), Arc::new(NoCallMonitor), bye).await;

        assert!(sip.sent().is_empty());
    }

    #[tokio::test]
    async fn post_after_close_is_dropped() {
        let sip = Arc::new(MockSipManager::new());
        let (dispatcher, _services) = start_dispatcher(sip.clone(), Arc::new(NoCallMonitor));
        dispatcher.close().await;

        dispatcher.post_request(invite_with("", ""));
        assert!(sip.sent().is_empty());
    }
}
