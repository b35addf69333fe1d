//! Connection Lifecycle Manager.
//!
//! Drives one connection through admission, its receive loop and teardown:
//!
//! ```text
//! Connecting -> Authenticating -> Upgrading -> Active -> Closing -> Closed
//!      |              |               |
//!      +--------------+---------------+----------------------------> Closed
//! ```
//!
//! A connection's `Joined` announcement is broadcast before its receive loop
//! starts, every chat frame is broadcast (and awaited) in arrival order, and
//! `Left` goes out only after the loop has ended and the connection has been
//! unregistered.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use crate::broadcast::Broadcaster;
use crate::connection::{Connection, OutboundReceiver};
use crate::error::{AdmissionError, ReceiveError};
use crate::registry::ConnectionRegistry;
use crate::types::{ChatMessage, ConnectionId, Identity, InboundFrame};
use crate::verifier::IdentityVerifier;

/// Default per-recipient send timeout.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of frames queued per connection before sends start waiting.
pub const DEFAULT_OUTBOUND_BUFFER: usize = 64;

/// Default largest inbound chat body, in bytes.
pub const DEFAULT_MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Tunables for the relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayConfig {
    /// Upper bound on one send to one recipient
    pub send_timeout: Duration,
    /// Outbound queue depth per connection
    pub outbound_buffer: usize,
    /// Inbound bodies larger than this are dropped
    pub max_message_bytes: usize,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            send_timeout: DEFAULT_SEND_TIMEOUT,
            outbound_buffer: DEFAULT_OUTBOUND_BUFFER,
            max_message_bytes: DEFAULT_MAX_MESSAGE_BYTES,
        }
    }
}

/// Per-connection lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Connecting,
    Authenticating,
    Upgrading,
    Active,
    Closing,
    Closed,
}

impl SessionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Connecting => "connecting",
            Self::Authenticating => "authenticating",
            Self::Upgrading => "upgrading",
            Self::Active => "active",
            Self::Closing => "closing",
            Self::Closed => "closed",
        }
    }

    /// Whether `next` is a legal successor of this state.
    pub fn can_transition_to(self, next: SessionState) -> bool {
        use SessionState::*;
        matches!(
            (self, next),
            (Connecting, Authenticating)
                | (Connecting, Closed)
                | (Authenticating, Upgrading)
                | (Authenticating, Closed)
                | (Upgrading, Active)
                | (Upgrading, Closed)
                | (Active, Closing)
                | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

fn advance(state: &mut SessionState, next: SessionState) {
    debug_assert!(
        state.can_transition_to(next),
        "illegal session transition {state} -> {next}"
    );
    debug!(from = %state, to = %next, "Session state transition");
    *state = next;
}

/// Why an active session stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEnd {
    /// Inbound stream finished
    StreamEnded,
    /// Peer closed or the read failed
    Receive(ReceiveError),
    /// Connection was closed from our side (failed delivery or shutdown)
    ConnectionClosed,
}

/// What happened during one session.
#[derive(Debug, Clone)]
pub struct SessionSummary {
    pub connection: ConnectionId,
    pub identity: Identity,
    /// Chat frames broadcast on behalf of this participant
    pub messages_relayed: usize,
    pub end: SessionEnd,
}

/// Closes the connection when dropped, whatever path teardown took.
struct CloseOnDrop(Connection);

impl Drop for CloseOnDrop {
    fn drop(&mut self) {
        self.0.close();
    }
}

/// The relay: admission, sessions and the shared registry.
pub struct Relay {
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
    verifier: Arc<dyn IdentityVerifier>,
    config: RelayConfig,
    shutdown: CancellationToken,
}

impl Relay {
    pub fn new(verifier: Arc<dyn IdentityVerifier>, config: RelayConfig) -> Self {
        Self::with_registry(Arc::new(ConnectionRegistry::new()), verifier, config)
    }

    pub fn with_registry(
        registry: Arc<ConnectionRegistry>,
        verifier: Arc<dyn IdentityVerifier>,
        config: RelayConfig,
    ) -> Self {
        let broadcaster = Broadcaster::new(Arc::clone(&registry), config.send_timeout);
        Self {
            registry,
            broadcaster,
            verifier,
            config,
            shutdown: CancellationToken::new(),
        }
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn config(&self) -> &RelayConfig {
        &self.config
    }

    /// Authenticate an upgrade request.
    ///
    /// `token` is the value of the request's credential cookie. A missing
    /// token is refused without consulting the verifier. Nothing is
    /// registered or broadcast on any path through here.
    #[instrument(skip_all)]
    pub async fn admit(&self, token: Option<&str>) -> Result<Identity, AdmissionError> {
        let mut state = SessionState::Connecting;

        let Some(token) = token else {
            warn!("Admission denied: credential cookie missing");
            advance(&mut state, SessionState::Closed);
            return Err(AdmissionError::MissingCredential);
        };

        advance(&mut state, SessionState::Authenticating);
        match self.verifier.verify(token).await {
            Ok(identity) => {
                advance(&mut state, SessionState::Upgrading);
                debug!(identity = %identity, "Admission granted");
                Ok(identity)
            }
            Err(failure) => {
                warn!(reason = %failure, "Admission denied");
                advance(&mut state, SessionState::Closed);
                Err(failure.into())
            }
        }
    }

    /// Record a transport upgrade that failed after admission.
    pub fn abandon_upgrade(&self, identity: &Identity, reason: impl fmt::Display) -> AdmissionError {
        let mut state = SessionState::Upgrading;
        warn!(identity = %identity, reason = %reason, "Transport upgrade failed");
        advance(&mut state, SessionState::Closed);
        AdmissionError::upgrade_failed(reason.to_string())
    }

    /// Open a connection handle for a freshly upgraded transport.
    ///
    /// The connection closes on [`Relay::shutdown`].
    pub fn open_connection(&self) -> (Connection, OutboundReceiver) {
        Connection::child_of(&self.shutdown, self.config.outbound_buffer)
    }

    /// Run an admitted connection until it ends.
    ///
    /// Registers the connection, announces it, relays each inbound text
    /// frame, then unregisters, announces the departure and closes the
    /// connection. The close happens even if this future is dropped early.
    #[instrument(skip(self, connection, inbound), fields(connection = %connection.id(), identity = %identity))]
    pub async fn run_session<S>(
        &self,
        identity: Identity,
        connection: Connection,
        mut inbound: S,
    ) -> SessionSummary
    where
        S: Stream<Item = Result<InboundFrame, ReceiveError>> + Unpin,
    {
        let _guard = CloseOnDrop(connection.clone());
        let id = connection.id();
        let mut state = SessionState::Upgrading;

        advance(&mut state, SessionState::Active);
        self.registry.register(connection.clone(), identity.clone());
        self.broadcaster.broadcast(&ChatMessage::joined(&identity)).await;
        info!(participants = self.registry.len(), "Participant joined");

        let mut messages_relayed = 0;
        let end = loop {
            let next = tokio::select! {
                biased;
                _ = connection.closed() => None,
                next = inbound.next() => Some(next),
            };

            match next {
                None => break SessionEnd::ConnectionClosed,
                Some(None) => break SessionEnd::StreamEnded,
                Some(Some(Err(e))) => break SessionEnd::Receive(e),
                Some(Some(Ok(frame))) => {
                    if let Some(body) = self.frame_body(frame) {
                        self.broadcaster
                            .broadcast(&ChatMessage::chat(&identity, body))
                            .await;
                        messages_relayed += 1;
                    }
                }
            }
        };

        advance(&mut state, SessionState::Closing);
        debug!(end = ?end, "Receive loop finished");
        self.registry.unregister(id);
        self.broadcaster.broadcast(&ChatMessage::left(&identity)).await;
        connection.close();
        advance(&mut state, SessionState::Closed);
        info!(messages_relayed, "Participant left");

        SessionSummary {
            connection: id,
            identity,
            messages_relayed,
            end,
        }
    }

    /// Extract the chat body from an inbound frame, if it carries one.
    fn frame_body(&self, frame: InboundFrame) -> Option<String> {
        let body = match frame {
            InboundFrame::Text(text) => text,
            InboundFrame::Binary(bytes) => match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Ignoring binary frame that is not UTF-8");
                    return None;
                }
            },
            InboundFrame::Control => return None,
        };

        if body.len() > self.config.max_message_bytes {
            warn!(
                len = body.len(),
                max = self.config.max_message_bytes,
                "Ignoring oversized message"
            );
            return None;
        }

        Some(body)
    }

    /// Close every connection opened through this relay.
    pub fn shutdown(&self) {
        info!(participants = self.registry.len(), "Closing all connections");
        self.shutdown.cancel();
    }
}

impl fmt::Debug for Relay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Relay")
            .field("registry", &self.registry)
            .field("config", &self.config)
            .finish()
    }
}
