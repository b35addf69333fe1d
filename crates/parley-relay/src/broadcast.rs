//! Broadcaster.
//!
//! Fans one message out to every registered connection. Each recipient gets
//! an independent, time-bounded send; sends run concurrently so one stalled
//! queue delays nobody else. Recipients that fail are unregistered and closed
//! once every send has finished. Their own session then tears down and
//! announces the departure, so there is never a broadcast inside a broadcast.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tracing::{debug, instrument, warn};

use crate::registry::ConnectionRegistry;
use crate::types::{ChatMessage, ConnectionId};

/// Outcome of one broadcast.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Number of snapshot entries a send was attempted to
    pub attempted: usize,
    /// Number of successful sends
    pub delivered: usize,
    /// Connections removed because their send failed
    pub dropped: Vec<ConnectionId>,
}

/// Delivers messages to every entry in a registry snapshot.
#[derive(Debug, Clone)]
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    send_timeout: Duration,
}

impl Broadcaster {
    pub fn new(registry: Arc<ConnectionRegistry>, send_timeout: Duration) -> Self {
        Self {
            registry,
            send_timeout,
        }
    }

    /// Send `message` to everyone currently registered.
    ///
    /// Never fails as a whole: per-recipient errors are logged and the
    /// offending connections dropped.
    #[instrument(skip(self, message), fields(kind = ?message.kind, sender = %message.sender_identity))]
    pub async fn broadcast(&self, message: &ChatMessage) -> BroadcastReport {
        let frame = message.to_wire();
        let recipients = self.registry.snapshot();
        debug!(recipients = recipients.len(), frame = %frame, "Broadcasting");

        let sends = recipients.iter().map(|participant| {
            let frame = frame.clone();
            async move {
                let result = participant
                    .connection
                    .try_deliver(frame, self.send_timeout)
                    .await;
                (participant, result)
            }
        });
        let results = join_all(sends).await;

        let mut report = BroadcastReport {
            attempted: results.len(),
            ..BroadcastReport::default()
        };
        for (participant, result) in results {
            match result {
                Ok(()) => report.delivered += 1,
                Err(e) => {
                    warn!(
                        connection = %participant.connection_id(),
                        identity = %participant.identity,
                        error = %e,
                        "Dropping recipient after failed delivery"
                    );
                    report.dropped.push(participant.connection_id());
                }
            }
        }

        for participant in recipients
            .iter()
            .filter(|p| report.dropped.contains(&p.connection_id()))
        {
            self.registry.unregister(participant.connection_id());
            participant.connection.close();
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connection::{Connection, OutboundReceiver};
    use crate::types::Identity;
    use std::time::Instant;

    const TIMEOUT: Duration = Duration::from_millis(100);

    fn setup() -> (Arc<ConnectionRegistry>, Broadcaster) {
        let registry = Arc::new(ConnectionRegistry::new());
        let broadcaster = Broadcaster::new(Arc::clone(&registry), TIMEOUT);
        (registry, broadcaster)
    }

    fn join(registry: &ConnectionRegistry, name: &str, buffer: usize) -> (Connection, OutboundReceiver) {
        let (conn, outbound) = Connection::open(buffer);
        registry.register(conn.clone(), Identity::new(name));
        (conn, outbound)
    }

    #[tokio::test]
    async fn test_broadcast_reaches_every_entry_once() {
        let (registry, broadcaster) = setup();
        let (_a, mut rx_a) = join(&registry, "alice", 8);
        let (_b, mut rx_b) = join(&registry, "bob", 8);

        let report = broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "hi"))
            .await;

        assert_eq!(report.attempted, 2);
        assert_eq!(report.delivered, 2);
        assert!(report.dropped.is_empty());
        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: hi"));
        assert_eq!(rx_b.recv().await.as_deref(), Some("alice: hi"));
    }

    #[tokio::test]
    async fn test_broadcast_to_empty_registry() {
        let (_registry, broadcaster) = setup();

        let report = broadcaster
            .broadcast(&ChatMessage::joined(&Identity::new("alice")))
            .await;

        assert_eq!(report, BroadcastReport::default());
    }

    #[tokio::test]
    async fn test_closed_recipient_is_dropped_and_others_still_served() {
        let (registry, broadcaster) = setup();
        let (_a, mut rx_a) = join(&registry, "alice", 8);
        let (b, rx_b) = join(&registry, "bob", 8);
        let (_c, mut rx_c) = join(&registry, "carol", 8);
        drop(rx_b);

        let report = broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "hello"))
            .await;

        assert_eq!(report.attempted, 3);
        assert_eq!(report.delivered, 2);
        assert_eq!(report.dropped, vec![b.id()]);
        assert!(!registry.contains(b.id()));
        assert_eq!(registry.len(), 2);
        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: hello"));
        assert_eq!(rx_c.recv().await.as_deref(), Some("alice: hello"));
    }

    #[tokio::test]
    async fn test_stalled_recipient_times_out_without_blocking_others() {
        let (registry, broadcaster) = setup();
        let (_a, mut rx_a) = join(&registry, "alice", 8);
        // One-slot queue that nobody drains.
        let (stalled, _rx_stalled) = join(&registry, "slow", 1);
        stalled
            .try_deliver("filler".to_string(), TIMEOUT)
            .await
            .unwrap();

        let started = Instant::now();
        let report = broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "ping"))
            .await;

        // Sends run side by side: one timeout, not one per recipient.
        assert!(started.elapsed() < TIMEOUT * 3);
        assert_eq!(report.dropped, vec![stalled.id()]);
        assert!(stalled.is_closed());
        assert!(!registry.contains(stalled.id()));
        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: ping"));
    }

    #[tokio::test]
    async fn test_dropped_recipient_not_attempted_again() {
        let (registry, broadcaster) = setup();
        let (_a, mut rx_a) = join(&registry, "alice", 8);
        let (_b, rx_b) = join(&registry, "bob", 8);
        drop(rx_b);

        broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "one"))
            .await;
        let second = broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "two"))
            .await;

        assert_eq!(second.attempted, 1);
        assert_eq!(second.delivered, 1);
        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: one"));
        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: two"));
    }

    #[tokio::test]
    async fn test_unregistered_connection_receives_nothing() {
        let (registry, broadcaster) = setup();
        let (_a, mut rx_a) = join(&registry, "alice", 8);
        let (c, rx_c) = join(&registry, "carol", 8);
        registry.unregister(c.id());

        broadcaster
            .broadcast(&ChatMessage::chat(&Identity::new("alice"), "hi"))
            .await;

        assert_eq!(rx_a.recv().await.as_deref(), Some("alice: hi"));
        assert!(rx_c.is_empty());
    }
}
