//! WebSocket push channel to the clinic backend.
//!
//! Implements [`PushChannel`] over a WebSocket connection. Frames are
//! postcard-encoded [`PushFrame`]s in binary messages. The first frame on a
//! connection identifies it; the backend answers `Identified` or `Error`.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use tokio::sync::{Mutex, mpsc};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};

use clinichat_proto::codec;
use clinichat_proto::message::ParticipantId;
use clinichat_proto::push::{Credential, InboundEvent, PushFrame};

use super::{ChannelError, Connector, PushChannel};

/// Write half of a WebSocket connection.
type WsSender = futures_util::stream::SplitSink<
    WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>,
    WsMessage,
>;

/// Read half of a WebSocket connection.
type WsReader =
    futures_util::stream::SplitStream<WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>>;

/// Connection parameters for [`RelayChannel::connect`].
#[derive(Debug, Clone)]
pub struct RelaySettings {
    /// Timeout for establishing the WebSocket connection.
    pub connect_timeout: Duration,
    /// Timeout for the backend to answer the `Identify` frame.
    pub identify_timeout: Duration,
    /// Capacity of the inbound event queue.
    pub capacity: usize,
}

impl Default for RelaySettings {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            identify_timeout: Duration::from_secs(5),
            capacity: 256,
        }
    }
}

/// WebSocket [`PushChannel`].
///
/// Created via [`RelayChannel::connect`], which connects, identifies, and
/// spawns a background reader task feeding [`PushChannel::recv`].
pub struct RelayChannel {
    local_id: ParticipantId,
    relay_url: String,
    ws_sender: Arc<Mutex<WsSender>>,
    incoming: Mutex<mpsc::Receiver<InboundEvent>>,
    connected: Arc<AtomicBool>,
    reader_handle: tokio::task::JoinHandle<()>,
}

impl RelayChannel {
    /// Connects to `relay_url` and identifies with `credential`.
    ///
    /// # Errors
    ///
    /// - [`ChannelError::Timeout`] if connecting or identifying times out.
    /// - [`ChannelError::Unreachable`] if nothing listens at `relay_url`.
    /// - [`ChannelError::Rejected`] if the backend refuses the credential.
    /// - [`ChannelError::Io`] for other WebSocket failures.
    pub async fn connect(
        relay_url: &str,
        credential: &Credential,
        settings: &RelaySettings,
    ) -> Result<Self, ChannelError> {
        let (ws_stream, _response) =
            tokio::time::timeout(settings.connect_timeout, connect_async(relay_url))
                .await
                .map_err(|_| {
                    tracing::warn!(url = relay_url, "push channel connect timed out");
                    ChannelError::Timeout
                })?
                .map_err(|e| {
                    tracing::warn!(url = relay_url, error = %e, "push channel connect failed");
                    map_ws_connect_error(relay_url, e)
                })?;

        let (mut ws_sender, mut ws_reader) = ws_stream.split();

        let identify = codec::encode(&PushFrame::Identify {
            credential: credential.clone(),
        })?;
        ws_sender
            .send(WsMessage::Binary(identify.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "failed to send Identify frame");
                ChannelError::Io(std::io::Error::other(format!("failed to send Identify: {e}")))
            })?;

        let ack = tokio::time::timeout(settings.identify_timeout, ws_reader.next())
            .await
            .map_err(|_| {
                tracing::warn!(url = relay_url, "identify acknowledgment timed out");
                ChannelError::Timeout
            })?;

        let local_id = match ack {
            Some(Ok(WsMessage::Binary(data))) => match codec::decode(&data)? {
                PushFrame::Identified { participant } => participant,
                PushFrame::Error { reason } => {
                    tracing::warn!(reason = %reason, kind = credential.kind(), "identify rejected");
                    return Err(ChannelError::Rejected(reason));
                }
                other => {
                    tracing::warn!(?other, "unexpected frame during identify");
                    return Err(ChannelError::Io(std::io::Error::other(
                        "unexpected frame during identify",
                    )));
                }
            },
            Some(Ok(WsMessage::Close(_))) | None => {
                tracing::warn!("backend closed connection during identify");
                return Err(ChannelError::ConnectionClosed);
            }
            Some(Ok(_)) => {
                return Err(ChannelError::Io(std::io::Error::other(
                    "unexpected non-binary frame during identify",
                )));
            }
            Some(Err(e)) => {
                return Err(ChannelError::Io(std::io::Error::other(format!(
                    "WebSocket error during identify: {e}"
                ))));
            }
        };

        tracing::info!(participant = %local_id, url = relay_url, "push channel identified");

        let (tx, rx) = mpsc::channel(settings.capacity);
        let connected = Arc::new(AtomicBool::new(true));
        let reader_handle = tokio::spawn(reader_loop(ws_reader, tx, Arc::clone(&connected)));

        Ok(Self {
            local_id,
            relay_url: relay_url.to_string(),
            ws_sender: Arc::new(Mutex::new(ws_sender)),
            incoming: Mutex::new(rx),
            connected,
            reader_handle,
        })
    }

    /// The backend URL this channel is connected to.
    #[must_use]
    pub fn relay_url(&self) -> &str {
        &self.relay_url
    }
}

impl PushChannel for RelayChannel {
    fn local_id(&self) -> &ParticipantId {
        &self.local_id
    }

    async fn send(&self, to: &ParticipantId, body: &str) -> Result<(), ChannelError> {
        if !self.connected.load(Ordering::Relaxed) {
            return Err(ChannelError::ConnectionClosed);
        }

        let bytes = codec::encode(&PushFrame::Send {
            to: to.clone(),
            body: body.to_string(),
        })?;

        let mut sender = self.ws_sender.lock().await;
        sender
            .send(WsMessage::Binary(bytes.into()))
            .await
            .map_err(|e| {
                tracing::warn!(error = %e, "push channel send failed");
                self.connected.store(false, Ordering::Relaxed);
                ChannelError::ConnectionClosed
            })
    }

    async fn recv(&self) -> Result<InboundEvent, ChannelError> {
        let mut rx = self.incoming.lock().await;
        rx.recv().await.ok_or(ChannelError::ConnectionClosed)
    }

    fn is_open(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    async fn close(&self) {
        self.connected.store(false, Ordering::Relaxed);
        let _ = self.ws_sender.lock().await.close().await;
        self.reader_handle.abort();
    }
}

impl Drop for RelayChannel {
    fn drop(&mut self) {
        self.reader_handle.abort();
    }
}

/// Background task: decodes WebSocket frames into inbound events.
///
/// Malformed frames are logged and skipped. Sets `connected` to `false`
/// when the WebSocket closes or errors out.
async fn reader_loop(
    mut ws_reader: WsReader,
    tx: mpsc::Sender<InboundEvent>,
    connected: Arc<AtomicBool>,
) {
    while let Some(msg_result) = ws_reader.next().await {
        match msg_result {
            Ok(WsMessage::Binary(data)) => match codec::decode(&data) {
                Ok(PushFrame::Inbound(event)) => {
                    if tx.send(event).await.is_err() {
                        break;
                    }
                }
                Ok(PushFrame::Error { reason }) => {
                    tracing::warn!(reason = %reason, "backend reported error");
                }
                Ok(other) => {
                    tracing::debug!(?other, "ignoring unexpected frame");
                }
                Err(e) => {
                    tracing::warn!(error = %e, "malformed push frame, skipping");
                }
            },
            Ok(WsMessage::Close(_)) => {
                tracing::info!("push channel closed by backend");
                break;
            }
            Ok(_) => {}
            Err(e) => {
                tracing::warn!(error = %e, "push channel read error");
                break;
            }
        }
    }
    connected.store(false, Ordering::Relaxed);
    tracing::info!("push channel reader exiting");
}

/// Map a `tokio_tungstenite` connection error to a [`ChannelError`].
fn map_ws_connect_error(url: &str, err: tokio_tungstenite::tungstenite::Error) -> ChannelError {
    use tokio_tungstenite::tungstenite::Error as WsError;
    match err {
        WsError::Io(io_err) => {
            if io_err.kind() == std::io::ErrorKind::ConnectionRefused
                || io_err.kind() == std::io::ErrorKind::AddrNotAvailable
            {
                ChannelError::Unreachable(url.to_string())
            } else {
                ChannelError::Io(io_err)
            }
        }
        WsError::Http(response) => ChannelError::Io(std::io::Error::other(format!(
            "backend HTTP error: status {}",
            response.status()
        ))),
        other => ChannelError::Io(std::io::Error::other(format!(
            "push channel connection error: {other}"
        ))),
    }
}

/// [`Connector`] opening [`RelayChannel`]s to a fixed URL.
#[derive(Debug, Clone)]
pub struct RelayConnector {
    relay_url: String,
    settings: RelaySettings,
}

impl RelayConnector {
    /// Creates a connector for `relay_url`.
    pub fn new(relay_url: impl Into<String>, settings: RelaySettings) -> Self {
        Self {
            relay_url: relay_url.into(),
            settings,
        }
    }
}

impl Connector for RelayConnector {
    type Channel = RelayChannel;

    async fn connect(&self, credential: &Credential) -> Result<RelayChannel, ChannelError> {
        RelayChannel::connect(&self.relay_url, credential, &self.settings).await
    }
}
