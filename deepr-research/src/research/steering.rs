//! Steering channel
//!
//! Operators submit guidance at any time; the controller takes at most one
//! message per loop boundary. Only the newest unconsumed message is kept.

use super::types::SteeringMessage;
use crate::{ResearchError, ResearchResult};
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::debug;

/// Create a connected handle/inbox pair for one session
pub fn steering_channel() -> (SteeringHandle, SteeringInbox) {
    let (tx, rx) = watch::channel(None);
    (
        SteeringHandle {
            tx: Arc::new(tx),
            next_seq: Arc::new(AtomicU64::new(1)),
        },
        SteeringInbox {
            rx,
            last_consumed: 0,
        },
    )
}

/// Sending side, held by the session manager
#[derive(Debug, Clone)]
pub struct SteeringHandle {
    tx: Arc<watch::Sender<Option<SteeringMessage>>>,
    next_seq: Arc<AtomicU64>,
}

impl SteeringHandle {
    /// Submit guidance; it supersedes any message not yet consumed
    pub fn submit(&self, text: &str) -> ResearchResult<SteeringMessage> {
        let text = text.trim();
        if text.is_empty() {
            return Err(ResearchError::validation("steering text must not be empty"));
        }

        let message = SteeringMessage {
            seq: self.next_seq.fetch_add(1, Ordering::SeqCst),
            text: text.to_string(),
            submitted_at: Utc::now(),
        };

        self.tx
            .send(Some(message.clone()))
            .map_err(|_| ResearchError::session("session no longer accepts steering"))?;

        debug!(seq = message.seq, "Steering message submitted");
        Ok(message)
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Receiving side, owned by the controller loop
#[derive(Debug)]
pub struct SteeringInbox {
    rx: watch::Receiver<Option<SteeringMessage>>,
    last_consumed: u64,
}

impl SteeringInbox {
    /// Take the active message, if one arrived since the last boundary
    pub fn take_active(&mut self) -> Option<SteeringMessage> {
        let current = self.rx.borrow_and_update().clone();
        match current {
            Some(message) if message.seq > self.last_consumed => {
                self.last_consumed = message.seq;
                Some(message)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_newest_message_supersedes_unconsumed() {
        let (handle, mut inbox) = steering_channel();
        handle.submit("focus on 2023").unwrap();
        handle.submit("focus on 2024 instead").unwrap();

        let active = inbox.take_active().unwrap();
        assert_eq!(active.text, "focus on 2024 instead");
        assert_eq!(active.seq, 2);
        assert!(inbox.take_active().is_none());
    }

    #[test]
    fn test_one_message_per_boundary() {
        let (handle, mut inbox) = steering_channel();
        assert!(inbox.take_active().is_none());

        handle.submit("first").unwrap();
        assert_eq!(inbox.take_active().unwrap().text, "first");

        handle.submit("second").unwrap();
        assert_eq!(inbox.take_active().unwrap().text, "second");
        assert!(inbox.take_active().is_none());
    }

    #[test]
    fn test_rejects_empty_and_closed() {
        let (handle, inbox) = steering_channel();
        assert!(matches!(
            handle.submit("   "),
            Err(ResearchError::Validation { .. })
        ));

        drop(inbox);
        assert!(handle.is_closed());
        assert!(handle.submit("too late").is_err());
    }
}
