//! Connection handles.
//!
//! A [`Connection`] is the relay's view of one live transport session: an
//! outbound frame queue plus a close token. The transport side owns the
//! matching [`OutboundReceiver`] and writes whatever it yields to the socket.
//!
//! ```text
//! Broadcaster --try_deliver--> mpsc::Sender<String> ==> OutboundReceiver --> socket writer
//!                                      |                        |
//!                                      +---- CancellationToken --+
//! ```
//!
//! Cancelling the token is the only way to close a connection. It stops the
//! writer and unblocks the session's receive loop.

use std::fmt;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::DeliveryError;
use crate::types::ConnectionId;

/// Cloneable handle to a live connection.
#[derive(Clone)]
pub struct Connection {
    id: ConnectionId,
    sender: mpsc::Sender<String>,
    close: CancellationToken,
}

/// Transport-side end of a connection's outbound queue.
pub struct OutboundReceiver {
    receiver: mpsc::Receiver<String>,
    close: CancellationToken,
}

impl Connection {
    /// Open a standalone connection with an outbound queue of `buffer` frames.
    pub fn open(buffer: usize) -> (Self, OutboundReceiver) {
        Self::with_token(buffer, CancellationToken::new())
    }

    /// Open a connection that also closes when `parent` is cancelled.
    pub fn child_of(parent: &CancellationToken, buffer: usize) -> (Self, OutboundReceiver) {
        Self::with_token(buffer, parent.child_token())
    }

    fn with_token(buffer: usize, close: CancellationToken) -> (Self, OutboundReceiver) {
        let (sender, receiver) = mpsc::channel(buffer.max(1));
        let connection = Self {
            id: ConnectionId::new(),
            sender,
            close: close.clone(),
        };
        (connection, OutboundReceiver { receiver, close })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Queue one whole frame, waiting at most `timeout` for queue space.
    pub async fn try_deliver(&self, frame: String, timeout: Duration) -> Result<(), DeliveryError> {
        if self.close.is_cancelled() {
            return Err(DeliveryError::Closed);
        }

        tokio::select! {
            biased;
            _ = self.close.cancelled() => Err(DeliveryError::Closed),
            result = self.sender.send_timeout(frame, timeout) => match result {
                Ok(()) => {
                    trace!(connection = %self.id, "Frame queued");
                    Ok(())
                }
                Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout),
                Err(SendTimeoutError::Closed(_)) => Err(DeliveryError::Closed),
            },
        }
    }

    /// Close the connection. Idempotent.
    pub fn close(&self) {
        self.close.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.close.is_cancelled() || self.sender.is_closed()
    }

    /// Resolves once the connection has been closed.
    pub async fn closed(&self) {
        self.close.cancelled().await
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl OutboundReceiver {
    /// Next frame to write, or `None` once the connection is closed.
    ///
    /// Frames still queued when the connection closes are discarded.
    pub async fn recv(&mut self) -> Option<String> {
        tokio::select! {
            biased;
            _ = self.close.cancelled() => None,
            frame = self.receiver.recv() => frame,
        }
    }

    /// Take an already-queued frame without waiting, closed or not.
    pub fn try_recv(&mut self) -> Option<String> {
        self.receiver.try_recv().ok()
    }

    /// True if no frame is waiting to be written.
    pub fn is_empty(&self) -> bool {
        self.receiver.is_empty()
    }

    /// Close the connection from the transport side, e.g. after a write error.
    pub fn close(&self) {
        self.close.cancel();
    }

    /// Token cancelled when this connection closes.
    pub fn close_token(&self) -> CancellationToken {
        self.close.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TIMEOUT: Duration = Duration::from_millis(50);

    #[tokio::test]
    async fn test_deliver_and_receive() {
        let (conn, mut outbound) = Connection::open(4);

        conn.try_deliver("hello".to_string(), TIMEOUT).await.unwrap();

        assert_eq!(outbound.recv().await.as_deref(), Some("hello"));
    }

    #[tokio::test]
    async fn test_deliver_times_out_when_queue_full() {
        let (conn, _outbound) = Connection::open(1);

        conn.try_deliver("first".to_string(), TIMEOUT).await.unwrap();
        let result = conn.try_deliver("second".to_string(), TIMEOUT).await;

        assert_eq!(result, Err(DeliveryError::Timeout));
    }

    #[tokio::test]
    async fn test_deliver_to_dropped_receiver_is_closed() {
        let (conn, outbound) = Connection::open(4);
        drop(outbound);

        let result = conn.try_deliver("hello".to_string(), TIMEOUT).await;
        assert_eq!(result, Err(DeliveryError::Closed));
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_close_stops_delivery_and_receiver() {
        let (conn, mut outbound) = Connection::open(4);
        conn.try_deliver("queued".to_string(), TIMEOUT).await.unwrap();

        conn.close();

        assert!(conn.is_closed());
        assert_eq!(
            conn.try_deliver("late".to_string(), TIMEOUT).await,
            Err(DeliveryError::Closed)
        );
        assert_eq!(outbound.recv().await, None);
    }

    #[tokio::test]
    async fn test_receiver_close_closes_connection() {
        let (conn, outbound) = Connection::open(4);

        outbound.close();

        conn.closed().await;
        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_child_connection_closes_with_parent() {
        let parent = CancellationToken::new();
        let (conn, _outbound) = Connection::child_of(&parent, 4);

        parent.cancel();

        assert!(conn.is_closed());
    }

    #[tokio::test]
    async fn test_zero_buffer_is_usable() {
        let (conn, mut outbound) = Connection::open(0);

        conn.try_deliver("hi".to_string(), TIMEOUT).await.unwrap();
        assert_eq!(outbound.recv().await.as_deref(), Some("hi"));
    }
}
