//! Backend core: shared state, push channel handler, participant registry,
//! message routing and the REST collaborator endpoints.
//!
//! Every push connection identifies itself with a [`Credential`] before
//! anything else. Messages sent over the channel are stamped with a server
//! timestamp, archived in the [`MessageArchive`] and forwarded to the
//! recipient when it is connected. Offline recipients catch up through the
//! history endpoint.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode, header};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use clinichat_proto::api::{MarkReadResponse, RosterEntry, UnreadCounts};
use clinichat_proto::codec;
use clinichat_proto::message::{MAX_BODY_SIZE, Message, ParticipantId, Timestamp, validate_body};
use clinichat_proto::push::{Credential, InboundEvent, PushFrame};
use clinichat_proto::scope::Universe;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use crate::config::StaffAccount;
use crate::store::MessageArchive;

/// Shared backend state holding the participant registry, the archive and
/// the accepted staff accounts.
pub struct RelayState {
    /// Maps a participant to the sender feeding its WebSocket writer.
    connections: RwLock<HashMap<ParticipantId, mpsc::UnboundedSender<WsMessage>>>,
    /// Every routed message, per conversation pair.
    pub archive: MessageArchive,
    staff: Vec<StaffAccount>,
    max_body_size: usize,
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

impl RelayState {
    /// Creates a state with no staff accounts and default limits.
    ///
    /// Only guests can identify against it.
    #[must_use]
    pub fn new() -> Self {
        Self::with_config(MAX_BODY_SIZE, MessageArchive::new(), Vec::new())
    }

    /// Creates a state with custom limits, archive and staff accounts.
    #[must_use]
    pub fn with_config(
        max_body_size: usize,
        archive: MessageArchive,
        staff: Vec<StaffAccount>,
    ) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            archive,
            staff,
            max_body_size,
        }
    }

    /// Creates a state with default limits and the given staff accounts.
    #[must_use]
    pub fn with_staff(staff: Vec<StaffAccount>) -> Self {
        Self::with_config(MAX_BODY_SIZE, MessageArchive::new(), staff)
    }

    /// Registers a participant's connection.
    ///
    /// A second connection for the same participant replaces the first; the
    /// previous sender is returned and dropped by the caller, which shuts the
    /// old writer task down.
    pub async fn register(
        &self,
        participant: &ParticipantId,
        sender: mpsc::UnboundedSender<WsMessage>,
    ) -> Option<mpsc::UnboundedSender<WsMessage>> {
        let mut conns = self.connections.write().await;
        conns.insert(participant.clone(), sender)
    }

    /// Removes a participant's connection if `sender` is still the
    /// registered one. Returns whether it was removed.
    pub async fn unregister(
        &self,
        participant: &ParticipantId,
        sender: &mpsc::UnboundedSender<WsMessage>,
    ) -> bool {
        let mut conns = self.connections.write().await;
        if conns
            .get(participant)
            .is_some_and(|current| current.same_channel(sender))
        {
            conns.remove(participant);
            true
        } else {
            false
        }
    }

    /// Returns a clone of the sender for the given participant, if connected.
    pub async fn get_sender(
        &self,
        participant: &ParticipantId,
    ) -> Option<mpsc::UnboundedSender<WsMessage>> {
        let conns = self.connections.read().await;
        conns.get(participant).cloned()
    }

    /// The staff account a token belongs to.
    #[must_use]
    pub fn staff_by_token(&self, token: &str) -> Option<&StaffAccount> {
        self.staff.iter().find(|s| s.token == token)
    }

    /// Resolves the participant a credential identifies as.
    ///
    /// # Errors
    ///
    /// Returns the rejection reason sent back to the client.
    pub fn authenticate(&self, credential: &Credential) -> Result<ParticipantId, String> {
        match credential {
            Credential::Guest(id) if id.is_guest() => Ok(id.clone()),
            Credential::Guest(id) => Err(format!("{id} is not a guest id")),
            Credential::Token(token) => self
                .staff_by_token(token)
                .map(|account| account.id.clone())
                .ok_or_else(|| "unknown session token".to_string()),
        }
    }

    fn display_name(&self, id: &ParticipantId) -> String {
        self.staff
            .iter()
            .find(|s| &s.id == id)
            .map_or_else(|| id.to_string(), |s| s.display_name.clone())
    }

    /// Counterparts `me` may talk to within `universe`: every staff member
    /// plus everyone `me` already exchanged messages with, restricted to
    /// pairs that belong to `universe`.
    pub async fn roster(&self, universe: Universe, me: &ParticipantId) -> Vec<RosterEntry> {
        let mut ids: BTreeSet<ParticipantId> = self.archive.counterparts(me).await;
        ids.extend(self.staff.iter().map(|s| s.id.clone()));
        ids.into_iter()
            .filter(|id| id != me && Universe::for_pair(me, id) == universe)
            .map(|id| {
                let name = self.display_name(&id);
                RosterEntry::new(id, name)
            })
            .collect()
    }
}

/// Handles an upgraded WebSocket connection for a single participant.
///
/// The connection lifecycle:
/// 1. Wait for an `Identify` frame and authenticate it.
/// 2. Register the participant and reply `Identified` (or `Error` and close).
/// 3. Enter the frame loop, routing `Send` frames to recipients.
/// 4. On disconnect, unregister the participant.
pub async fn handle_socket(socket: WebSocket, state: Arc<RelayState>) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(credential) = wait_for_identify(&mut ws_receiver).await else {
        tracing::warn!("connection closed before identification");
        return;
    };

    let participant = match state.authenticate(&credential) {
        Ok(participant) => participant,
        Err(reason) => {
            tracing::warn!(kind = credential.kind(), reason = %reason, "identify rejected");
            if let Err(e) = send_frame(&mut ws_sender, &PushFrame::Error { reason }).await {
                tracing::debug!(error = %e, "failed to send rejection");
            }
            return;
        }
    };

    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    if state.register(&participant, tx.clone()).await.is_some() {
        tracing::info!(participant = %participant, "replaced existing connection");
    }

    let ack = PushFrame::Identified {
        participant: participant.clone(),
    };
    if let Err(e) = send_frame(&mut ws_sender, &ack).await {
        tracing::error!(participant = %participant, error = %e, "failed to send Identified ack");
        state.unregister(&participant, &tx).await;
        return;
    }

    tracing::info!(participant = %participant, kind = credential.kind(), "participant identified");

    let writer_id = participant.clone();
    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(participant = %writer_id, "WebSocket write failed");
                break;
            }
        }
    });

    let reader_id = participant.clone();
    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Binary(data) => {
                    handle_binary_frame(&reader_id, &data, &reader_state).await;
                }
                WsMessage::Close(_) => {
                    tracing::info!(participant = %reader_id, "received close frame");
                    break;
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.unregister(&participant, &tx).await;
    tracing::info!(participant = %participant, "participant disconnected");
}

/// Waits for the first frame on the WebSocket, expecting `Identify`.
async fn wait_for_identify(
    receiver: &mut (impl StreamExt<Item = Result<WsMessage, axum::Error>> + Unpin),
) -> Option<Credential> {
    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            WsMessage::Binary(data) => match codec::decode(&data) {
                Ok(PushFrame::Identify { credential }) => return Some(credential),
                Ok(other) => {
                    tracing::warn!(frame = ?other, "expected Identify, got different frame");
                    return None;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "failed to decode identify frame");
                    return None;
                }
            },
            WsMessage::Close(_) => return None,
            _ => {}
        }
    }
    None
}

/// Handles a binary frame from an identified participant.
async fn handle_binary_frame(participant: &ParticipantId, data: &[u8], state: &Arc<RelayState>) {
    let frame = match codec::decode(data) {
        Ok(f) => f,
        Err(e) => {
            tracing::warn!(participant = %participant, error = %e, "failed to decode frame");
            return;
        }
    };

    match frame {
        PushFrame::Send { to, body } => route_message(state, participant, to, body).await,
        PushFrame::Identify { credential } => {
            tracing::warn!(
                participant = %participant,
                kind = credential.kind(),
                "duplicate Identify from identified participant"
            );
        }
        other => {
            tracing::warn!(participant = %participant, frame = ?other, "unexpected frame from client");
        }
    }
}

/// Validates, stamps, archives and forwards one message.
///
/// The sender is always the identified participant, never a client claim.
async fn route_message(
    state: &Arc<RelayState>,
    from: &ParticipantId,
    to: ParticipantId,
    body: String,
) {
    let rejection = if to.is_empty() || &to == from {
        Some("invalid recipient".to_string())
    } else if body.len() > state.max_body_size {
        Some(format!(
            "message too large ({} bytes, max {} bytes)",
            body.len(),
            state.max_body_size
        ))
    } else {
        validate_body(&body).err().map(|e| e.to_string())
    };
    if let Some(reason) = rejection {
        tracing::warn!(from = %from, to = %to, reason = %reason, "message rejected");
        send_to_participant(state, from, &PushFrame::Error { reason }).await;
        return;
    }

    let timestamp = Timestamp::now();
    let archived = state.archive.append(from, &to, &body, timestamp).await;
    tracing::debug!(from = %from, to = %to, id = ?archived.id, "routing message");

    let Some(sender) = state.get_sender(&to).await else {
        tracing::info!(to = %to, "recipient offline, message archived");
        return;
    };
    let frame = PushFrame::Inbound(InboundEvent::new(from.clone(), body).to(to.clone()).at(timestamp));
    match codec::encode(&frame) {
        Ok(bytes) => {
            if sender.send(WsMessage::Binary(bytes.into())).is_err() {
                tracing::warn!(to = %to, "forward failed, unregistering recipient");
                state.unregister(&to, &sender).await;
            }
        }
        Err(e) => tracing::error!(error = %e, "failed to encode inbound frame"),
    }
}

/// Sends a frame to a connected participant via its channel.
async fn send_to_participant(state: &Arc<RelayState>, participant: &ParticipantId, frame: &PushFrame) {
    if let Some(sender) = state.get_sender(participant).await
        && let Ok(bytes) = codec::encode(frame)
    {
        let _ = sender.send(WsMessage::Binary(bytes.into()));
    }
}

/// Encodes and sends a frame directly on a WebSocket sender.
async fn send_frame(
    ws_sender: &mut (impl SinkExt<WsMessage, Error = axum::Error> + Unpin),
    frame: &PushFrame,
) -> Result<(), String> {
    let bytes = codec::encode(frame).map_err(|e| e.to_string())?;
    ws_sender
        .send(WsMessage::Binary(bytes.into()))
        .await
        .map_err(|e| format!("WebSocket send error: {e}"))
}

// ---------------------------------------------------------------------------
// REST collaborator endpoints
// ---------------------------------------------------------------------------

/// Rejections of the REST endpoints.
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// No bearer token, or one no staff account owns.
    #[error("missing or unknown bearer token")]
    Unauthorized,
    /// The token belongs to someone other than the path participant.
    #[error("token does not belong to {0}")]
    Forbidden(ParticipantId),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self {
            Self::Unauthorized => StatusCode::UNAUTHORIZED,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
        };
        (status, self.to_string()).into_response()
    }
}

/// Guests need no token; staff must present their own.
fn authorize(
    state: &RelayState,
    headers: &HeaderMap,
    self_id: &ParticipantId,
) -> Result<(), ApiError> {
    if self_id.is_guest() {
        return Ok(());
    }
    let token = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;
    let account = state.staff_by_token(token).ok_or(ApiError::Unauthorized)?;
    if &account.id == self_id {
        Ok(())
    } else {
        Err(ApiError::Forbidden(self_id.clone()))
    }
}

async fn history_handler(
    State(state): State<Arc<RelayState>>,
    Path((self_id, counterpart)): Path<(ParticipantId, ParticipantId)>,
    headers: HeaderMap,
) -> Result<Json<Vec<Message>>, ApiError> {
    authorize(&state, &headers, &self_id)?;
    Ok(Json(state.archive.history(&self_id, &counterpart).await))
}

async fn roster_handler(
    State(state): State<Arc<RelayState>>,
    Path((universe, self_id)): Path<(Universe, ParticipantId)>,
    headers: HeaderMap,
) -> Result<Json<Vec<RosterEntry>>, ApiError> {
    authorize(&state, &headers, &self_id)?;
    Ok(Json(state.roster(universe, &self_id).await))
}

async fn unread_handler(
    State(state): State<Arc<RelayState>>,
    Path(self_id): Path<ParticipantId>,
    headers: HeaderMap,
) -> Result<Json<UnreadCounts>, ApiError> {
    authorize(&state, &headers, &self_id)?;
    Ok(Json(state.archive.unread_counts(&self_id).await))
}

async fn mark_read_handler(
    State(state): State<Arc<RelayState>>,
    Path((self_id, counterpart)): Path<(ParticipantId, ParticipantId)>,
    headers: HeaderMap,
) -> Result<Json<MarkReadResponse>, ApiError> {
    authorize(&state, &headers, &self_id)?;
    let marked = state.archive.mark_read(&self_id, &counterpart).await;
    if marked > 0 {
        tracing::debug!(participant = %self_id, counterpart = %counterpart, marked, "conversation marked read");
    }
    Ok(Json(MarkReadResponse { marked }))
}

/// axum handler that upgrades an HTTP request to a WebSocket connection.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<RelayState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Builds the backend router: the push channel at `/ws` and the REST
/// endpoints under `/api`.
pub fn router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/api/history/{self_id}/{counterpart}", get(history_handler))
        .route("/api/roster/{universe}/{self_id}", get(roster_handler))
        .route("/api/unread/{self_id}", get(unread_handler))
        .route("/api/read/{self_id}/{counterpart}", post(mark_read_handler))
        .with_state(state)
}

/// Starts the backend on the given address and returns the bound address
/// and a join handle.
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(RelayState::new())).await
}

/// Starts the backend with a pre-configured [`RelayState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<RelayState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = router(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "backend server error");
        }
    });

    Ok((bound_addr, handle))
}
