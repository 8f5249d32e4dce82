//! SIP dialog path.
//!
//! A [`DialogPath`] tracks one dialog's identifiers, sequencing and routing
//! state. It is owned by exactly one session and only ever mutated from that
//! session's task.

use crate::error::{Error, Result};
use crate::message::{self, Method, Request};

#[derive(Debug)]
pub struct DialogPath {
    call_id: String,
    /// Remote target URI; request URI for new in-dialog requests.
    target: String,
    local_party: String,
    remote_party: String,
    local_tag: String,
    /// Learned from the remote side, never chosen locally.
    remote_tag: Option<String>,
    cseq: u32,
    /// Fixed at dialog creation.
    route_set: Vec<String>,
    /// SDP offer carried by the initial INVITE (terminating side).
    remote_content: Option<String>,
    sig_established: bool,
    session_terminated: bool,
    session_cancelled: bool,
}

impl DialogPath {
    /// Dialog path for a session we originate (UAC role).
    ///
    /// `route` is the stack's pre-configured default route.
    pub fn new_originating(
        call_id: impl Into<String>,
        initial_cseq: u32,
        target: impl Into<String>,
        local_party: impl Into<String>,
        remote_party: impl Into<String>,
        route: Vec<String>,
    ) -> Self {
        DialogPath {
            call_id: call_id.into(),
            target: target.into(),
            local_party: local_party.into(),
            remote_party: remote_party.into(),
            local_tag: message::generate_tag(),
            remote_tag: None,
            cseq: initial_cseq,
            route_set: route,
            remote_content: None,
            sig_established: false,
            session_terminated: false,
            session_cancelled: false,
        }
    }

    /// Dialog path for a session initiated by the remote side (UAS role).
    ///
    /// Subsequent requests must travel back through the proxies that routed
    /// the INVITE to us, so the route set is the INVITE's Record-Route list
    /// reversed. Header validation happened in the parsing layer; only a
    /// missing Call-ID or CSeq is rejected here.
    pub fn new_terminating(invite: &Request) -> Result<Self> {
        let call_id = invite
            .call_id()
            .ok_or(Error::MissingRequiredHeader("Call-ID"))?
            .to_string();
        let (cseq, _) = invite.cseq().ok_or(Error::MissingRequiredHeader("CSeq"))?;
        let target = invite.contact_uri().unwrap_or_else(|| invite.uri.clone());

        let local_party = invite.to().map(strip_tag).unwrap_or_default();
        let remote_party = invite.from().map(strip_tag).unwrap_or_default();
        let remote_tag = invite.from_tag().map(|t| t.to_string());

        let mut route_set = invite.record_routes();
        route_set.reverse();

        Ok(DialogPath {
            call_id,
            target,
            local_party,
            remote_party,
            local_tag: message::generate_tag(),
            remote_tag,
            cseq,
            route_set,
            remote_content: invite.body.clone(),
            sig_established: false,
            session_terminated: false,
            session_cancelled: false,
        })
    }

    pub fn call_id(&self) -> &str {
        &self.call_id
    }

    pub fn target(&self) -> &str {
        &self.target
    }

    pub fn local_party(&self) -> &str {
        &self.local_party
    }

    pub fn remote_party(&self) -> &str {
        &self.remote_party
    }

    pub fn local_tag(&self) -> &str {
        &self.local_tag
    }

    pub fn remote_tag(&self) -> Option<&str> {
        self.remote_tag.as_deref()
    }

    pub fn set_remote_tag(&mut self, tag: impl Into<String>) {
        self.remote_tag = Some(tag.into());
    }

    pub fn cseq(&self) -> u32 {
        self.cseq
    }

    /// Must be called once before building any new request in the dialog.
    pub fn increment_cseq(&mut self) {
        self.cseq += 1;
    }

    pub fn route_set(&self) -> &[String] {
        &self.route_set
    }

    pub fn remote_content(&self) -> Option<&str> {
        self.remote_content.as_deref()
    }

    pub fn set_sig_established(&mut self) {
        self.sig_established = true;
    }

    pub fn is_sig_established(&self) -> bool {
        self.sig_established
    }

    pub fn set_session_terminated(&mut self) {
        self.session_terminated = true;
    }

    pub fn is_session_terminated(&self) -> bool {
        self.session_terminated
    }

    pub fn set_session_cancelled(&mut self) {
        self.session_cancelled = true;
    }

    pub fn is_session_cancelled(&self) -> bool {
        self.session_cancelled
    }

    fn is_finished(&self) -> bool {
        self.session_terminated || self.session_cancelled
    }

    /// Builds a new request within the dialog using the current CSeq.
    ///
    /// After the dialog is terminated or cancelled only the terminating
    /// BYE/CANCEL itself may still be built.
    pub fn make_request(&self, method: Method) -> Result<Request> {
        if self.is_finished() && !matches!(method, Method::Bye | Method::Cancel) {
            return Err(Error::DialogTerminated);
        }

        let mut request = Request::new(method.clone(), self.target.clone());
        request
            .headers
            .push("From", format!("{};tag={}", self.local_party, self.local_tag));
        match &self.remote_tag {
            Some(tag) => request
                .headers
                .push("To", format!("{};tag={}", self.remote_party, tag)),
            None => request.headers.push("To", self.remote_party.clone()),
        }
        request.headers.push("Call-ID", self.call_id.clone());
        for route in &self.route_set {
            request.headers.push("Route", route.clone());
        }
        request
            .headers
            .push("CSeq", format!("{} {}", self.cseq, method));
        request.headers.push("Max-Forwards", "70");

        Ok(request)
    }
}

fn strip_tag(value: &str) -> String {
    match value.split_once(";tag=") {
        Some((before, _)) => before.trim_end().to_string(),
        None => value.to_string(),
    }
}
