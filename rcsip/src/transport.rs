//! Outbound SIP plumbing.
//!
//! Message sending lives outside this crate: a [`SipManager`] implementation
//! owns the sockets, the wire encoder and the transaction retransmission
//! logic. The signaling core only needs fire-and-forget sending plus the
//! ability to wait for the final response of a transaction it started.

use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::Result;
use crate::message::{Response, SipMessage};

/// The SIP send interface consumed by sessions and the dispatcher.
#[async_trait::async_trait]
pub trait SipManager: Send + Sync + 'static {
    /// Sends a message without tracking the transaction.
    async fn send(&self, message: SipMessage) -> Result<()>;

    /// Sends a request and returns a context that resolves once a final
    /// response arrives.
    async fn send_and_wait(&self, message: SipMessage) -> Result<TransactionContext>;
}

/// Completion handle for one client transaction.
///
/// A timed-out or interrupted wait is not an error: `is_response_received`
/// stays false and callers branch on that.
pub struct TransactionContext {
    rx: Mutex<Option<oneshot::Receiver<Response>>>,
    response: Mutex<Option<Response>>,
}

impl TransactionContext {
    /// Creates a context and the sender the transport completes it with.
    pub fn new() -> (TransactionContext, oneshot::Sender<Response>) {
        let (tx, rx) = oneshot::channel();
        let ctx = TransactionContext {
            rx: Mutex::new(Some(rx)),
            response: Mutex::new(None),
        };
        (ctx, tx)
    }

    /// Waits up to `timeout` for the final response.
    pub async fn wait_response(&self, timeout: Duration) {
        let rx = self.rx.lock().expect("lock failed").take();
        let Some(rx) = rx else { return };

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => {
                *self.response.lock().expect("lock failed") = Some(response);
            }
            // Sender dropped or timer fired: both read as "no response".
            Ok(Err(_)) | Err(_) => {}
        }
    }

    pub fn is_response_received(&self) -> bool {
        self.response.lock().expect("lock failed").is_some()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response
            .lock()
            .expect("lock failed")
            .as_ref()
            .map(|r| r.status_code)
    }

    pub fn response(&self) -> Option<Response> {
        self.response.lock().expect("lock failed").clone()
    }
}
