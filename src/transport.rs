//! # Transport Links
//!
//! Adapters never touch sockets directly. Each connection is represented as a
//! `Link`: a pair of unbounded text channels, one per direction. The network
//! side (an actix WebSocket actor for telephony, a tungstenite client for the
//! AI service) pumps frames between the socket and the link; the adapter runs
//! ordinary `recv().await` loops on the other end.
//!
//! Dropping the adapter's `outgoing` sender is how an adapter closes its
//! connection, and `incoming.recv()` returning `None` is how it learns the
//! peer went away.

use tokio::sync::mpsc;

/// One end of a bidirectional text channel.
#[derive(Debug)]
pub struct Link {
    pub outgoing: mpsc::UnboundedSender<String>,
    pub incoming: mpsc::UnboundedReceiver<String>,
}

impl Link {
    /// Two connected ends: whatever one side sends, the other receives.
    pub fn pair() -> (Link, Link) {
        let (a_tx, b_rx) = mpsc::unbounded_channel();
        let (b_tx, a_rx) = mpsc::unbounded_channel();
        (
            Link { outgoing: a_tx, incoming: a_rx },
            Link { outgoing: b_tx, incoming: b_rx },
        )
    }

    pub fn split(self) -> (mpsc::UnboundedSender<String>, mpsc::UnboundedReceiver<String>) {
        (self.outgoing, self.incoming)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_pair_is_crossed() {
        let (mut left, mut right) = Link::pair();
        left.outgoing.send("ping".to_string()).unwrap();
        right.outgoing.send("pong".to_string()).unwrap();

        assert_eq!(right.incoming.recv().await.as_deref(), Some("ping"));
        assert_eq!(left.incoming.recv().await.as_deref(), Some("pong"));
    }

    #[tokio::test]
    async fn test_dropping_sender_closes_peer() {
        let (left, mut right) = Link::pair();
        drop(left);
        assert_eq!(right.incoming.recv().await, None);
    }
}
