//! MSRP connection: one framed TCP stream feeding one session.
//!
//! The reader task routes inbound frames into the session; the writer task
//! drains an outbound queue so that senders never block on the socket.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::error::{Error, Result};
use crate::msrp::codec::{MsrpCodec, MsrpMessage};
use crate::msrp::session::{MsrpSession, MsrpTransport};

pub struct MsrpConnection {
    /// Dropped on close, which ends the writer task.
    tx: Mutex<Option<mpsc::UnboundedSender<MsrpMessage>>>,
}

impl MsrpConnection {
    /// Opens the active side of an MSRP connection.
    pub async fn connect(addr: SocketAddr, session: Arc<MsrpSession>) -> Result<Arc<Self>> {
        let stream = TcpStream::connect(addr).await?;
        log::debug!("msrp: connected to {}", addr);
        Ok(Self::from_stream(stream, session))
    }

    /// Wraps an already established stream (the passive side hands over the
    /// accepted socket here).
    pub fn from_stream(stream: TcpStream, session: Arc<MsrpSession>) -> Arc<Self> {
        let framed = Framed::new(stream, MsrpCodec);
        let (mut sink, mut frames) = framed.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<MsrpMessage>();

        tokio::spawn(async move {
            while let Some(message) = rx.recv().await {
                if let Err(err) = sink.send(message).await {
                    log::warn!("msrp: write failed: {}", err);
                    break;
                }
            }
        });

        tokio::spawn(async move {
            while let Some(frame) = frames.next().await {
                match frame {
                    Ok(message) => route(&session, message).await,
                    Err(err) => {
                        log::warn!("msrp: read failed: {}", err);
                        break;
                    }
                }
            }
            // Socket gone: release anything still waiting on the session.
            session.close();
        });

        Arc::new(MsrpConnection {
            tx: Mutex::new(Some(tx)),
        })
    }
}

async fn route(session: &Arc<MsrpSession>, message: MsrpMessage) {
    match message {
        MsrpMessage::Request(request) => match request.method.as_str() {
            "SEND" => {
                let body = request.body.clone().unwrap_or_default();
                let total = request
                    .byte_range()
                    .and_then(|r| r.total)
                    .unwrap_or(body.len() as u64);
                session
                    .receive_send(
                        &request.tx_id,
                        &request.headers,
                        request.continuation,
                        &body,
                        total,
                    )
                    .await;
            }
            "REPORT" => session.receive_report(&request.tx_id, &request.headers).await,
            other => log::debug!("msrp: ignoring {} request {}", other, request.tx_id),
        },
        MsrpMessage::Response(response) => {
            session.receive_response(response.status_code, &response.tx_id)
        }
    }
}

#[async_trait::async_trait]
impl MsrpTransport for MsrpConnection {
    async fn send_message(&self, message: MsrpMessage) -> Result<()> {
        let tx = self.tx.lock().expect("lock failed").clone();
        match tx {
            Some(tx) => tx.send(message).map_err(|_| Error::SessionClosed),
            None => Err(Error::SessionClosed),
        }
    }

    fn close(&self) {
        self.tx.lock().expect("lock failed").take();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    async fn pair() -> (TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let client = TcpStream::connect(addr).await.unwrap();
        let (server, _) = listener.accept().await.unwrap();
        (client, server)
    }

    fn session() -> Arc<MsrpSession> {
        let session = MsrpSession::new(2048, Duration::from_secs(5));
        session.set_from_path("msrp://10.0.0.1:2855/s1;tcp");
        session.set_to_path("msrp://10.0.0.2:2855/s2;tcp");
        session
    }

    #[tokio::test]
    async fn outbound_frames_reach_the_wire() {
        let (client, mut server) = pair().await;
        let session = session();
        let connection = MsrpConnection::from_stream(client, session.clone());
        session.set_transport(connection);

        session.send_empty_chunk().await.unwrap();

        let mut buf = vec![0u8; 1024];
        let n = server.read(&mut buf).await.unwrap();
        let text = std::str::from_utf8(&buf[..n]).unwrap();
        assert!(text.starts_with("MSRP "));
        assert!(text.contains("Byte-Range: 1-0/0\r\n"));
    }

    #[tokio::test]
    async fn inbound_frames_route_into_the_session() {
        let (client, server) = pair().await;

        // Receiver side.
        let receiver = session();
        let received = Arc::new(std::sync::Mutex::new(Vec::new()));
        struct Collect(Arc<std::sync::Mutex<Vec<Vec<u8>>>>);
        impl crate::msrp::session::MsrpEventListener for Collect {
            fn on_data_received(&self, _id: &str, data: &[u8], _ct: &str) {
                self.0.lock().unwrap().push(data.to_vec());
            }
        }
        receiver.set_listener(Arc::new(Collect(received.clone())));
        let rx_conn = MsrpConnection::from_stream(server, receiver.clone());
        receiver.set_transport(rx_conn);

        // Sender side.
        let sender = session();
        let tx_conn = MsrpConnection::from_stream(client, sender.clone());
        sender.set_transport(tx_conn);

        let mut input = &b"over the wire"[..];
        sender.send_chunks(&mut input, "text/plain", 13).await.unwrap();

        // The SEND needed a 200 back, so once send_chunks returned the data
        // has been through both directions.
        let received = received.lock().unwrap();
        assert_eq!(received.as_slice(), [b"over the wire".to_vec()]);
    }

    #[tokio::test]
    async fn peer_disconnect_closes_the_session() {
        let (client, server) = pair().await;
        let session = session();
        let connection = MsrpConnection::from_stream(client, session.clone());
        session.set_transport(connection);

        drop(server);
        // Reader task observes EOF and closes the session, releasing any
        // waiter and cancelling a transfer in progress.
        tokio::time::timeout(Duration::from_secs(1), async {
            while !session.is_closed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("session never closed after peer disconnect");
    }
}
