//! Chat over WebSocket.
//!
//! `GET /ws` authenticates the `Authorization` cookie before upgrading.
//! Rejected requests get a 401 and never reach the relay's registry. After
//! the upgrade one task writes the connection's outbound frames to the
//! socket while the handler task runs the relay session over the inbound
//! half. A write never outlives the connection: once it closes, a pending
//! write to a peer that stopped reading is abandoned and the socket dropped.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{rejection::WebSocketUpgradeRejection, Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Json, Response},
};
use axum_extra::extract::cookie::CookieJar;
use futures::{Sink, SinkExt, StreamExt};
use parley_relay::{
    AdmissionError, ConnectionId, Identity, InboundFrame, OutboundReceiver, ReceiveError, Relay,
};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::server::AppState;

/// Cookie carrying the signed credential.
pub const AUTH_COOKIE: &str = "Authorization";

/// How long a closing handshake may take before the socket is dropped.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long the handler waits for the writer after the session ends.
const WRITER_GRACE: Duration = Duration::from_secs(2);

/// Error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub message: String,
}

impl ErrorResponse {
    fn new(error: &str, message: &str) -> Self {
        Self {
            error: error.to_string(),
            message: message.to_string(),
        }
    }
}

/// Convert AdmissionError to HTTP response
fn admission_error_to_response(err: AdmissionError) -> (StatusCode, Json<ErrorResponse>) {
    let status = match &err {
        AdmissionError::MissingCredential
        | AdmissionError::UntrustedAlgorithm
        | AdmissionError::Expired
        | AdmissionError::Malformed
        | AdmissionError::UnknownSubject => StatusCode::UNAUTHORIZED,
        AdmissionError::UpgradeFailed(_) => StatusCode::BAD_REQUEST,
    };

    (status, Json(ErrorResponse::new(err.code(), &err.to_string())))
}

/// GET /ws
///
/// Authenticates, then upgrades to a WebSocket and joins the chat.
pub async fn websocket_handler(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    let token = jar.get(AUTH_COOKIE).map(|cookie| cookie.value().to_string());

    let identity = match state.relay.admit(token.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => return admission_error_to_response(e).into_response(),
    };

    let ws = match ws {
        Ok(ws) => ws,
        Err(rejection) => {
            let err = state.relay.abandon_upgrade(&identity, &rejection);
            debug!(code = err.code(), "Upgrade request rejected");
            return rejection.into_response();
        }
    };

    info!(identity = %identity, "WebSocket connection request");

    let relay = Arc::clone(&state.relay);
    let failed_relay = Arc::clone(&state.relay);
    let failed_identity = identity.clone();

    ws.on_failed_upgrade(move |e| {
        failed_relay.abandon_upgrade(&failed_identity, e);
    })
    .on_upgrade(move |socket| handle_socket(socket, relay, identity))
}

/// Map one WebSocket message to a relay frame.
fn inbound_frame(message: Result<Message, axum::Error>) -> Result<InboundFrame, ReceiveError> {
    match message {
        Ok(Message::Text(text)) => Ok(InboundFrame::Text(text)),
        Ok(Message::Binary(bytes)) => Ok(InboundFrame::Binary(bytes)),
        Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => Ok(InboundFrame::Control),
        Ok(Message::Close(_)) => Err(ReceiveError::Closed),
        Err(e) => Err(ReceiveError::transport(e.to_string())),
    }
}

/// Write outbound frames to `sink` until the connection closes.
///
/// A write error closes the connection. Closing the connection abandons a
/// write that is still pending.
async fn write_outbound<S>(mut sink: S, mut outbound: OutboundReceiver, connection: ConnectionId)
where
    S: Sink<Message> + Unpin,
    S::Error: fmt::Display,
{
    let closed = outbound.close_token();

    while let Some(frame) = outbound.recv().await {
        let sent = tokio::select! {
            biased;
            _ = closed.cancelled() => {
                debug!(connection = %connection, "Connection closed with a write pending");
                return;
            }
            sent = sink.send(Message::Text(frame)) => sent,
        };

        if let Err(e) = sent {
            debug!(connection = %connection, error = %e, "WebSocket write failed");
            outbound.close();
            return;
        }
    }

    if tokio::time::timeout(CLOSE_GRACE, sink.close()).await.is_err() {
        debug!(connection = %connection, "Close frame not flushed in time");
    }
}

/// Drive an upgraded socket until the session ends.
async fn handle_socket(socket: WebSocket, relay: Arc<Relay>, identity: Identity) {
    let (sink, stream) = socket.split();
    let (connection, outbound) = relay.open_connection();
    let connection_id = connection.id();

    let mut writer = tokio::spawn(write_outbound(sink, outbound, connection_id));

    let summary = relay
        .run_session(identity, connection, stream.map(inbound_frame))
        .await;

    match tokio::time::timeout(WRITER_GRACE, &mut writer).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(connection = %connection_id, error = %e, "WebSocket writer task failed");
        }
        Err(_) => {
            warn!(connection = %connection_id, "WebSocket writer did not stop, aborting it");
            writer.abort();
        }
    }

    info!(
        connection = %summary.connection,
        identity = %summary.identity,
        messages = summary.messages_relayed,
        end = ?summary.end,
        "WebSocket connection closed"
    );
}
