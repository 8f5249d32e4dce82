//! # rcsip
//!
//! An IMS/RCS client signaling core: SIP dialog and session state machines,
//! an inbound-request dispatcher with feature-tag classification, and an
//! MSRP media-transport layer for chunked content exchange.
//!
//! The wire-format SIP parser and the sockets live outside this crate; they
//! plug in through [`transport::SipManager`] and [`ImsModule::post_request`].

pub mod auth;
pub mod dialog;
pub mod dispatcher;
pub mod message;
pub mod module;
pub mod msrp;
pub mod service;
pub mod session;
pub mod transport;

pub(crate) mod error;

pub use dialog::DialogPath;
pub use dispatcher::{classify_invite, ImsServiceDispatcher, InviteTarget};
pub use error::{Error, Result};
pub use module::{ImsConfig, ImsModule};
pub use service::ServiceRegistry;
pub use session::{InvitationStatus, SessionCore, SessionHandler};
pub use transport::SipManager;

#[cfg(test)]
#[macro_use]
extern crate assert_matches;
