//! MSRP session: chunked send/receive over one connection.
//!
//! A session segments outbound content into bounded SEND chunks and
//! reassembles inbound chunks. Response and report arrival are the only
//! cross-task handoff points; both go through a single watch monitor so
//! that `close()` can release every waiter unconditionally.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::message::Headers;
use crate::msrp::codec::{
    generate_transaction_id, ByteRange, Continuation, MsrpMessage, MsrpRequest, MsrpResponse,
};

/// Frame-level sink the session writes through. Implemented by
/// [`MsrpConnection`](crate::msrp::connection::MsrpConnection).
#[async_trait::async_trait]
pub trait MsrpTransport: Send + Sync + 'static {
    async fn send_message(&self, message: MsrpMessage) -> Result<()>;

    /// Tears the connection down. Must be idempotent.
    fn close(&self);
}

/// Callbacks reporting transfer progress to the owning session layer.
pub trait MsrpEventListener: Send + Sync + 'static {
    fn on_data_transferred(&self, _message_id: &str) {}
    fn on_data_received(&self, _message_id: &str, _data: &[u8], _content_type: &str) {}
    fn on_progress(&self, _current: u64, _total: u64) {}
    fn on_transfer_aborted(&self) {}
    fn on_transfer_error(&self, _message_id: &str, _error: &str) {}
}

#[derive(Debug, Clone, Copy, Default)]
struct TransferMonitor {
    /// Count of responses seen, so waiters can detect "one more arrived".
    responses: u64,
    reports: u64,
    closed: bool,
}

pub struct MsrpSession {
    from_path: Mutex<Option<String>>,
    to_path: Mutex<Option<String>>,
    transport: Mutex<Option<Arc<dyn MsrpTransport>>>,
    listener: Mutex<Option<Arc<dyn MsrpEventListener>>>,
    /// Failure reports default to required; the header is only emitted when
    /// they are switched off.
    failure_report: AtomicBool,
    /// Success reports default to off; the header is only emitted when on.
    success_report: AtomicBool,
    cancelled: AtomicBool,
    /// Reassembly buffer for the inbound message in progress.
    rx_buffer: Mutex<BytesMut>,
    monitor: watch::Sender<TransferMonitor>,
    chunk_size: usize,
    transaction_timeout: Duration,
}

impl MsrpSession {
    pub fn new(chunk_size: usize, transaction_timeout: Duration) -> Arc<Self> {
        let (monitor, _) = watch::channel(TransferMonitor::default());
        Arc::new(MsrpSession {
            from_path: Mutex::new(None),
            to_path: Mutex::new(None),
            transport: Mutex::new(None),
            listener: Mutex::new(None),
            failure_report: AtomicBool::new(true),
            success_report: AtomicBool::new(false),
            cancelled: AtomicBool::new(false),
            rx_buffer: Mutex::new(BytesMut::new()),
            monitor,
            chunk_size,
            transaction_timeout,
        })
    }

    pub fn set_from_path(&self, path: impl Into<String>) {
        *self.from_path.lock().expect("lock failed") = Some(path.into());
    }

    pub fn set_to_path(&self, path: impl Into<String>) {
        *self.to_path.lock().expect("lock failed") = Some(path.into());
    }

    pub fn set_transport(&self, transport: Arc<dyn MsrpTransport>) {
        *self.transport.lock().expect("lock failed") = Some(transport);
    }

    pub fn set_listener(&self, listener: Arc<dyn MsrpEventListener>) {
        *self.listener.lock().expect("lock failed") = Some(listener);
    }

    pub fn set_failure_report_option(&self, enabled: bool) {
        self.failure_report.store(enabled, Ordering::SeqCst);
    }

    pub fn set_success_report_option(&self, enabled: bool) {
        self.success_report.store(enabled, Ordering::SeqCst);
    }

    /// Requests a mid-transfer abort; checked between chunks.
    pub fn cancel_transfer(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn paths(&self) -> Result<(String, String)> {
        let from = self
            .from_path
            .lock()
            .expect("lock failed")
            .clone()
            .ok_or(Error::NotConfigured("MSRP From-Path"))?;
        let to = self
            .to_path
            .lock()
            .expect("lock failed")
            .clone()
            .ok_or(Error::NotConfigured("MSRP To-Path"))?;
        Ok((from, to))
    }

    fn transport(&self) -> Result<Arc<dyn MsrpTransport>> {
        self.transport
            .lock()
            .expect("lock failed")
            .clone()
            .ok_or(Error::NotConfigured("MSRP connection"))
    }

    fn listener(&self) -> Option<Arc<dyn MsrpEventListener>> {
        self.listener.lock().expect("lock failed").clone()
    }

    /// Segments `input` into SEND chunks and transmits them in order.
    ///
    /// Blocks per chunk for the transaction response when failure reports
    /// are on, and at end of input for the REPORT when success reports are
    /// on. Cancellation stops the loop and returns `Ok`: an aborted transfer
    /// is a normal outcome. At most one transfer may run per session.
    pub async fn send_chunks(
        &self,
        input: &mut (dyn AsyncRead + Unpin + Send),
        content_type: &str,
        total_size: u64,
    ) -> Result<()> {
        let (from, to) = self.paths()?;
        let transport = self.transport()?;
        self.cancelled.store(false, Ordering::SeqCst);

        // Snapshot before the first send so a report racing the final chunk
        // cannot be missed.
        let mut report_rx = self.monitor.subscribe();
        let reports_seen = report_rx.borrow().reports;

        let message_id = Uuid::new_v4().to_string();
        let mut pending = read_chunk(input, self.chunk_size).await?;
        let mut offset: u64 = 0;

        loop {
            if self.cancelled.load(Ordering::SeqCst) {
                log::info!("msrp: transfer {} cancelled at byte {}", message_id, offset);
                return Ok(());
            }

            // A short read means end of input; only a full chunk can be
            // followed by more data.
            let next = if pending.len() < self.chunk_size {
                Vec::new()
            } else {
                read_chunk(input, self.chunk_size).await?
            };
            let continuation = if next.is_empty() {
                Continuation::Last
            } else {
                Continuation::More
            };

            let first = offset + 1;
            let last = offset + pending.len() as u64;
            let mut request = MsrpRequest::new(generate_transaction_id(), "SEND");
            request.headers.push("To-Path", to.clone());
            request.headers.push("From-Path", from.clone());
            request.headers.push("Message-ID", message_id.clone());
            request
                .headers
                .push("Byte-Range", ByteRange::new(first, last, total_size).to_string());
            if !self.failure_report.load(Ordering::SeqCst) {
                request.headers.push("Failure-Report", "no");
            }
            if self.success_report.load(Ordering::SeqCst) {
                request.headers.push("Success-Report", "yes");
            }
            request.headers.push("Content-Type", content_type.to_string());
            request.body = Some(Bytes::from(std::mem::take(&mut pending)));
            request.continuation = continuation;

            // Snapshot the counter before sending so a fast response cannot
            // slip past the wait.
            let mut rx = self.monitor.subscribe();
            let seen = rx.borrow().responses;
            transport.send_message(request.into()).await?;

            if self.failure_report.load(Ordering::SeqCst) {
                self.wait_monitor(&mut rx, move |m| m.closed || m.responses > seen)
                    .await;
            }

            offset = last;
            if let Some(listener) = self.listener() {
                listener.on_progress(offset, total_size);
            }

            if continuation == Continuation::Last {
                break;
            }
            pending = next;
        }

        if self.success_report.load(Ordering::SeqCst) {
            self.wait_monitor(&mut report_rx, move |m| {
                m.closed || m.reports > reports_seen
            })
            .await;
        }

        if let Some(listener) = self.listener() {
            listener.on_data_transferred(&message_id);
        }
        Ok(())
    }

    /// Zero-length SEND used to keep the session alive.
    pub async fn send_empty_chunk(&self) -> Result<()> {
        let (from, to) = self.paths()?;
        let transport = self.transport()?;

        let mut request = MsrpRequest::new(generate_transaction_id(), "SEND");
        request.headers.push("To-Path", to);
        request.headers.push("From-Path", from);
        request.headers.push("Message-ID", Uuid::new_v4().to_string());
        request
            .headers
            .push("Byte-Range", ByteRange::new(1, 0, 0).to_string());
        transport.send_message(request.into()).await
    }

    /// Handles one inbound SEND chunk.
    pub async fn receive_send(
        &self,
        tx_id: &str,
        headers: &Headers,
        flag: Continuation,
        data: &[u8],
        total_size: u64,
    ) {
        // Failure reports are required unless explicitly suppressed; answer
        // before touching the data.
        let failure_report = headers.get("Failure-Report").unwrap_or("yes");
        if !failure_report.eq_ignore_ascii_case("no") {
            self.send_ok_response(tx_id, headers).await;
        }

        match flag {
            Continuation::More => {
                let current = {
                    let mut buffer = self.rx_buffer.lock().expect("lock failed");
                    buffer.extend_from_slice(data);
                    buffer.len() as u64
                };
                if let Some(listener) = self.listener() {
                    listener.on_progress(current, total_size);
                }
            }
            Continuation::Last => {
                let payload = {
                    let mut buffer = self.rx_buffer.lock().expect("lock failed");
                    buffer.extend_from_slice(data);
                    buffer.split().freeze()
                };
                let message_id = headers.get("Message-ID").unwrap_or_default().to_string();
                let content_type = headers.get("Content-Type").unwrap_or_default().to_string();
                if let Some(listener) = self.listener() {
                    listener.on_data_received(&message_id, &payload, &content_type);
                }

                let success_report = headers.get("Success-Report").unwrap_or("no");
                if success_report.eq_ignore_ascii_case("yes") {
                    self.send_report(headers, &message_id, payload.len() as u64)
                        .await;
                }
            }
            Continuation::Aborted => {
                log::info!("msrp: remote aborted transfer {}", tx_id);
                self.rx_buffer.lock().expect("lock failed").clear();
                if let Some(listener) = self.listener() {
                    listener.on_transfer_aborted();
                }
            }
        }
    }

    /// Handles a transaction response: always releases the waiting sender,
    /// and surfaces non-200 codes as transfer errors.
    pub fn receive_response(&self, status_code: u16, tx_id: &str) {
        self.monitor.send_modify(|m| m.responses += 1);
        if status_code != 200 {
            log::warn!("msrp: transaction {} failed with {}", tx_id, status_code);
            if let Some(listener) = self.listener() {
                listener.on_transfer_error(tx_id, &format!("response {}", status_code));
            }
        }
    }

    /// Handles an inbound REPORT: answers 200, then releases report waiters.
    pub async fn receive_report(&self, tx_id: &str, headers: &Headers) {
        self.send_ok_response(tx_id, headers).await;
        self.monitor.send_modify(|m| m.reports += 1);
    }

    pub fn is_closed(&self) -> bool {
        self.monitor.borrow().closed
    }

    /// Closes the session: cancels any transfer, drops the connection and
    /// releases every waiter. Safe to call repeatedly and concurrently.
    pub fn close(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
        if let Some(transport) = self.transport.lock().expect("lock failed").take() {
            transport.close();
        }
        self.monitor.send_modify(|m| m.closed = true);
    }

    async fn send_report(&self, send_headers: &Headers, message_id: &str, size: u64) {
        let Ok(transport) = self.transport() else {
            return;
        };
        let mut report = MsrpRequest::new(generate_transaction_id(), "REPORT");
        // Paths swap direction relative to the SEND we are reporting on.
        if let Some(from) = send_headers.get("From-Path") {
            report.headers.push("To-Path", from);
        }
        if let Some(to) = send_headers.get("To-Path") {
            report.headers.push("From-Path", to);
        }
        report.headers.push("Message-ID", message_id.to_string());
        report
            .headers
            .push("Byte-Range", ByteRange::new(1, size, size).to_string());
        report.headers.push("Status", "000 200 OK");

        let mut rx = self.monitor.subscribe();
        let seen = rx.borrow().responses;
        if let Err(err) = transport.send_message(report.into()).await {
            log::warn!("msrp: failed to send REPORT: {}", err);
            return;
        }
        self.wait_monitor(&mut rx, move |m| m.closed || m.responses > seen)
            .await;
    }

    async fn send_ok_response(&self, tx_id: &str, request_headers: &Headers) {
        let Ok(transport) = self.transport() else {
            log::warn!("msrp: no connection to answer transaction {}", tx_id);
            return;
        };
        let mut response = MsrpResponse::new(tx_id, 200, "OK");
        if let Some(from) = request_headers.get("From-Path") {
            response.headers.push("To-Path", from);
        }
        if let Some(to) = request_headers.get("To-Path") {
            response.headers.push("From-Path", to);
        }
        if let Err(err) = transport.send_message(response.into()).await {
            log::warn!("msrp: failed to answer transaction {}: {}", tx_id, err);
        }
    }

    /// Interruption and timeout both read as "not signalled"; callers branch
    /// on session state, not on an error.
    async fn wait_monitor(
        &self,
        rx: &mut watch::Receiver<TransferMonitor>,
        predicate: impl FnMut(&TransferMonitor) -> bool,
    ) {
        let _ = tokio::time::timeout(self.transaction_timeout, rx.wait_for(predicate)).await;
    }
}

async fn read_chunk(
    input: &mut (dyn AsyncRead + Unpin + Send),
    size: usize,
) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; size];
    let mut filled = 0;
    while filled < size {
        let n = input.read(&mut buf[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf.truncate(filled);
    Ok(buf)
}


#[cfg(test)]
mod tests {
    use super::mock::MockTransport;
    use super::*;

    fn configured_session(transport: Arc<MockTransport>) -> Arc<MsrpSession> {
        let session = MsrpSession::new(4, Duration::from_secs(5));
        session.set_from_path("msrp://10.0.0.1:2855/s1;tcp");
        session.set_to_path("msrp://10.0.0.2:2855/s2;tcp");
        session.set_transport(transport);
        session
    }

    #[derive(Default)]
    struct RecordingListener {
        received: Mutex<Vec<(String, Vec<u8>, String)>>,
        progress: Mutex<Vec<(u64, u64)>>,
        transferred: Mutex<Vec<String>>,
        aborted: AtomicBool,
    }

    impl MsrpEventListener for RecordingListener {
        fn on_data_transferred(&self, message_id: &str) {
            self.transferred.lock().unwrap().push(message_id.to_string());
        }

        fn on_data_received(&self, message_id: &str, data: &[u8], content_type: &str) {
            self.received.lock().unwrap().push((
                message_id.to_string(),
                data.to_vec(),
                content_type.to_string(),
            ));
        }

        fn on_progress(&self, current: u64, total: u64) {
            self.progress.lock().unwrap().push((current, total));
        }

        fn on_transfer_aborted(&self) {
            self.aborted.store(true, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn send_chunks_requires_configuration() {
        let session = MsrpSession::new(4, Duration::from_secs(1));
        let mut input = &b"data"[..];
        let result = session.send_chunks(&mut input, "text/plain", 4).await;
        assert_matches!(result, Err(Error::NotConfigured(_)));
    }

    #[tokio::test]
    async fn chunking_marks_only_the_final_chunk_last() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());
        session.set_failure_report_option(false);

        let mut input = &b"0123456789"[..];
        session.send_chunks(&mut input, "text/plain", 10).await.unwrap();

        let requests = transport.sent_requests();
        assert_eq!(requests.len(), 3);
        assert_eq!(
            requests.iter().map(|r| r.continuation).collect::<Vec<_>>(),
            [Continuation::More, Continuation::More, Continuation::Last]
        );
        assert_eq!(requests[0].byte_range(), Some(ByteRange::new(1, 4, 10)));
        assert_eq!(requests[1].byte_range(), Some(ByteRange::new(5, 8, 10)));
        assert_eq!(requests[2].byte_range(), Some(ByteRange::new(9, 10, 10)));
        // Failure reports disabled: the header must say so explicitly.
        assert_eq!(requests[0].headers.get("Failure-Report"), Some("no"));
        assert_eq!(requests[0].headers.get("Success-Report"), None);
    }

    #[tokio::test]
    async fn reassembly_yields_original_bytes() {
        let transport = MockTransport::new();
        let sender = configured_session(transport.clone());
        sender.set_failure_report_option(false);
        let mut input = &b"the quick brown fox"[..];
        sender
            .send_chunks(&mut input, "text/plain", 19)
            .await
            .unwrap();

        let receiver = configured_session(MockTransport::new());
        let listener = Arc::new(RecordingListener::default());
        receiver.set_listener(listener.clone());
        for request in transport.sent_requests() {
            let body = request.body.clone().unwrap_or_default();
            receiver
                .receive_send(&request.tx_id, &request.headers, request.continuation, &body, 19)
                .await;
        }

        let received = listener.received.lock().unwrap();
        assert_eq!(received.len(), 1);
        assert_eq!(received[0].1, b"the quick brown fox");
        assert_eq!(received[0].2, "text/plain");
    }

    #[tokio::test]
    async fn inbound_send_is_answered_unless_suppressed() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());

        let mut headers = Headers::new();
        headers.push("From-Path", "msrp://10.0.0.2:2855/s2;tcp");
        headers.push("To-Path", "msrp://10.0.0.1:2855/s1;tcp");
        session
            .receive_send("tx1", &headers, Continuation::Last, b"hi", 2)
            .await;
        assert_eq!(transport.sent().len(), 1);
        let MsrpMessage::Response(resp) = &transport.sent()[0] else {
            panic!("expected a response");
        };
        assert_eq!(resp.status_code, 200);
        // Paths travel back swapped.
        assert_eq!(resp.headers.get("To-Path"), Some("msrp://10.0.0.2:2855/s2;tcp"));

        headers.push("Failure-Report", "no");
        session
            .receive_send("tx2", &headers, Continuation::Last, b"hi", 2)
            .await;
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn last_chunk_with_success_report_sends_report() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());

        let mut headers = Headers::new();
        headers.push("From-Path", "msrp://10.0.0.2:2855/s2;tcp");
        headers.push("To-Path", "msrp://10.0.0.1:2855/s1;tcp");
        headers.push("Message-ID", "msg-9");
        headers.push("Failure-Report", "no");
        headers.push("Success-Report", "yes");
        session
            .receive_send("tx1", &headers, Continuation::Last, b"abcdef", 6)
            .await;

        let requests = transport.sent_requests();
        assert_eq!(requests.len(), 1);
        let report = &requests[0];
        assert_eq!(report.method, "REPORT");
        assert_eq!(report.headers.get("Status"), Some("000 200 OK"));
        assert_eq!(report.headers.get("Message-ID"), Some("msg-9"));
        assert_eq!(report.byte_range(), Some(ByteRange::new(1, 6, 6)));
        // Report goes back toward the sender of the SEND.
        assert_eq!(report.headers.get("To-Path"), Some("msrp://10.0.0.2:2855/s2;tcp"));
    }

    #[tokio::test]
    async fn success_report_wait_is_released_by_report() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());
        session.set_failure_report_option(false);
        session.set_success_report_option(true);

        let sender = session.clone();
        let task = tokio::spawn(async move {
            let mut input = &b"hi"[..];
            sender.send_chunks(&mut input, "text/plain", 2).await
        });
        tokio::task::yield_now().await;

        let headers = Headers::new();
        session.receive_report("tx-any", &headers).await;
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn close_releases_blocked_sender() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());
        session.set_failure_report_option(false);
        session.set_success_report_option(true);

        let sender = session.clone();
        let task = tokio::spawn(async move {
            let mut input = &b"hi"[..];
            sender.send_chunks(&mut input, "text/plain", 2).await
        });
        tokio::task::yield_now().await;

        session.close();
        task.await.unwrap().unwrap();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn close_is_idempotent_across_tasks() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());

        let mut tasks = Vec::new();
        for _ in 0..4 {
            let session = session.clone();
            tasks.push(tokio::spawn(async move { session.close() }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        session.close();
        assert!(transport.is_closed());
    }

    #[tokio::test]
    async fn aborted_chunk_discards_partial_data() {
        let session = configured_session(MockTransport::new());
        let listener = Arc::new(RecordingListener::default());
        session.set_listener(listener.clone());

        let mut headers = Headers::new();
        headers.push("Failure-Report", "no");
        session
            .receive_send("tx1", &headers, Continuation::More, b"part", 8)
            .await;
        session
            .receive_send("tx1", &headers, Continuation::Aborted, b"", 8)
            .await;

        assert!(listener.aborted.load(Ordering::SeqCst));
        assert!(listener.received.lock().unwrap().is_empty());
        assert!(session.rx_buffer.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn cancellation_stops_mid_transfer_without_error() {
        let transport = MockTransport::new();
        let session = configured_session(transport.clone());
        session.set_failure_report_option(false);
        session.cancel_transfer();

        // The cancel flag set before the loop starts is cleared by
        // send_chunks; cancel again from the listener to hit the
        // between-chunks check.
        struct CancelAfterFirst(Arc<MsrpSession>);
        impl MsrpEventListener for CancelAfterFirst {
            fn on_progress(&self, _current: u64, _total: u64) {
                self.0.cancel_transfer();
            }
        }
        session.set_listener(Arc::new(CancelAfterFirst(session.clone())));

        let mut input = &b"0123456789abcdef"[..];
        session.send_chunks(&mut input, "text/plain", 16).await.unwrap();

        // First chunk went out, then the cancel check stopped the loop.
        assert_eq!(transport.sent_requests().len(), 1);
    }
}
