//! Stack assembly.
//!
//! One [`ImsModule`] per process: it owns the service registry and the
//! dispatcher, and is the context object everything else receives instead
//! of reaching for globals.

use std::sync::Arc;
use std::time::Duration;

use crate::auth::UserCredentials;
use crate::dialog::DialogPath;
use crate::dispatcher::{
    CallMonitor, ImsServiceDispatcher, IntentBroadcaster, NoCallMonitor, NoIntentBroadcaster,
};
use crate::message::{self, Request};
use crate::msrp::session::MsrpSession;
use crate::service::ServiceRegistry;
use crate::transport::SipManager;

pub const DEFAULT_RINGING_PERIOD: Duration = Duration::from_secs(30);
pub const DEFAULT_SIP_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_MSRP_CHUNK_SIZE: usize = 2048;

#[derive(Clone)]
pub struct ImsConfig {
    /// Local party identity placed in From on originated dialogs.
    pub public_identity: String,
    /// Pre-configured route for originated requests.
    pub default_route: Vec<String>,
    pub credentials: UserCredentials,
    pub ringing_period: Duration,
    pub sip_transaction_timeout: Duration,
    pub msrp_chunk_size: usize,
}

impl Default for ImsConfig {
    fn default() -> Self {
        ImsConfig {
            public_identity: String::new(),
            default_route: Vec::new(),
            credentials: UserCredentials::default(),
            ringing_period: DEFAULT_RINGING_PERIOD,
            sip_transaction_timeout: DEFAULT_SIP_TRANSACTION_TIMEOUT,
            msrp_chunk_size: DEFAULT_MSRP_CHUNK_SIZE,
        }
    }
}

pub struct Builder {
    config: ImsConfig,
    call_monitor: Arc<dyn CallMonitor>,
    intents: Arc<dyn IntentBroadcaster>,
}

impl Default for Builder {
    fn default() -> Self {
        Builder {
            config: ImsConfig::default(),
            call_monitor: Arc::new(NoCallMonitor),
            intents: Arc::new(NoIntentBroadcaster),
        }
    }
}

impl Builder {
    pub fn new() -> Builder {
        Builder::default()
    }

    pub fn public_identity(mut self, identity: impl Into<String>) -> Self {
        self.config.public_identity = identity.into();
        self
    }

    pub fn default_route(mut self, route: Vec<String>) -> Self {
        self.config.default_route = route;
        self
    }

    pub fn credentials(mut self, credentials: UserCredentials) -> Self {
        self.config.credentials = credentials;
        self
    }

    pub fn ringing_period(mut self, period: Duration) -> Self {
        self.config.ringing_period = period;
        self
    }

    pub fn sip_transaction_timeout(mut self, timeout: Duration) -> Self {
        self.config.sip_transaction_timeout = timeout;
        self
    }

    pub fn msrp_chunk_size(mut self, size: usize) -> Self {
        self.config.msrp_chunk_size = size;
        self
    }

    pub fn call_monitor(mut self, monitor: Arc<dyn CallMonitor>) -> Self {
        self.call_monitor = monitor;
        self
    }

    pub fn intent_broadcaster(mut self, intents: Arc<dyn IntentBroadcaster>) -> Self {
        self.intents = intents;
        self
    }

    /// Wires the services and starts the dispatcher worker.
    pub fn build(self, sip: Arc<dyn SipManager>) -> ImsModule {
        let services = ServiceRegistry::new(
            sip.clone(),
            self.config.credentials.clone(),
            self.config.ringing_period,
            self.config.sip_transaction_timeout,
        );
        let dispatcher =
            ImsServiceDispatcher::start(sip.clone(), services.clone(), self.call_monitor, self.intents);
        ImsModule {
            config: self.config,
            sip,
            services,
            dispatcher,
        }
    }
}

pub struct ImsModule {
    config: ImsConfig,
    sip: Arc<dyn SipManager>,
    services: Arc<ServiceRegistry>,
    dispatcher: ImsServiceDispatcher,
}

impl ImsModule {
    pub fn builder() -> Builder {
        Builder::new()
    }

    pub fn config(&self) -> &ImsConfig {
        &self.config
    }

    pub fn sip(&self) -> &Arc<dyn SipManager> {
        &self.sip
    }

    pub fn services(&self) -> &Arc<ServiceRegistry> {
        &self.services
    }

    /// Entry point for network receive tasks.
    pub fn post_request(&self, request: Request) {
        self.dispatcher.post_request(request);
    }

    /// Dialog path for a session this stack originates.
    pub fn originating_dialog(&self, remote_party: impl Into<String>) -> DialogPath {
        let remote_party = remote_party.into();
        DialogPath::new_originating(
            message::generate_call_id(),
            1,
            remote_party.clone(),
            self.config.public_identity.clone(),
            remote_party,
            self.config.default_route.clone(),
        )
    }

    /// MSRP session pre-sized from the stack configuration.
    pub fn create_msrp_session(&self) -> Arc<MsrpSession> {
        MsrpSession::new(self.config.msrp_chunk_size, self.config.sip_transaction_timeout)
    }

    /// Closes the dispatcher and aborts every live session.
    pub async fn stop(&self) {
        log::info!("stopping IMS module");
        self.dispatcher.close().await;
        self.services.abort_all().await;
    }
}
