//! Transition events for diagnostics.
//!
//! Every state change of a command sender is published as a
//! [`TransitionEvent`] on a broadcast channel. Publishing never blocks and
//! never fails; with no subscribers the event is only kept in the recent ring.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::command::CommandId;

/// What caused a transition.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum TransitionTrigger {
    /// A command was posted
    Post,
    /// The CAR state was read after posting
    Baseline,
    /// The Apply record reported a client id
    ApplyValue(i32),
    /// The CAR record reported an acknowledged client id
    CarClid(i32),
    /// The CAR record reported a state
    CarState(String),
    /// The command timer expired
    Timeout,
    /// The sender was unbound
    Unbind,
    /// A transport read or write failed while posting
    TransportFailure,
}

/// One state change of a command sender.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransitionEvent {
    /// Event ID
    pub id: Uuid,
    /// Name of the sender
    pub sender: String,
    /// Command in flight when the transition happened
    pub command_id: Option<CommandId>,
    pub trigger: TransitionTrigger,
    /// State signature before the transition
    pub from: String,
    /// State signature after the transition
    pub to: String,
    pub timestamp: DateTime<Utc>,
}

impl TransitionEvent {
    pub fn new(
        sender: impl Into<String>,
        command_id: Option<CommandId>,
        trigger: TransitionTrigger,
        from: String,
        to: String,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender: sender.into(),
            command_id,
            trigger,
            from,
            to,
            timestamp,
        }
    }

    /// Whether the transition left the state unchanged.
    pub fn is_self_loop(&self) -> bool {
        self.from == self.to
    }
}

/// Broadcast channel plus a bounded ring of recent transitions.
pub struct TransitionBus {
    tx: broadcast::Sender<TransitionEvent>,
    recent: Mutex<VecDeque<TransitionEvent>>,
    max_stored: usize,
}

impl TransitionBus {
    /// Create a bus keeping at most `capacity` events, both in the broadcast
    /// channel and in the recent ring.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let (tx, _) = broadcast::channel(capacity);
        Self {
            tx,
            recent: Mutex::new(VecDeque::with_capacity(capacity)),
            max_stored: capacity,
        }
    }

    /// Publish an event.
    pub fn publish(&self, event: TransitionEvent) {
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.max_stored {
                recent.pop_front();
            }
            recent.push_back(event.clone());
        }
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    /// Subscribe to events published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<TransitionEvent> {
        self.tx.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// The most recent `limit` events, oldest first.
    pub fn recent(&self, limit: usize) -> Vec<TransitionEvent> {
        let recent = self.recent.lock();
        let start = recent.len().saturating_sub(limit);
        recent.iter().skip(start).cloned().collect()
    }

    /// Recorded events for one command, oldest first.
    pub fn for_command(&self, command_id: &CommandId) -> Vec<TransitionEvent> {
        self.recent
            .lock()
            .iter()
            .filter(|e| e.command_id.as_ref() == Some(command_id))
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(trigger: TransitionTrigger, from: &str, to: &str) -> TransitionEvent {
        TransitionEvent::new(
            "tc1",
            None,
            trigger,
            from.to_string(),
            to.to_string(),
            Utc::now(),
        )
    }

    #[tokio::test]
    async fn test_publish_subscribe() {
        let bus = TransitionBus::new(16);
        let mut rx = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 1);

        bus.publish(event(TransitionTrigger::Post, "Idle", "WaitPreset"));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.trigger, TransitionTrigger::Post);
        assert_eq!(received.sender, "tc1");
        assert!(!received.is_self_loop());
    }

    #[test]
    fn test_publish_without_subscribers() {
        let bus = TransitionBus::new(16);
        bus.publish(event(TransitionTrigger::Timeout, "Idle", "Idle"));
        assert_eq!(bus.recent(10).len(), 1);
    }

    #[test]
    fn test_recent_is_bounded() {
        let bus = TransitionBus::new(3);
        for clid in 0..5 {
            bus.publish(event(TransitionTrigger::ApplyValue(clid), "a", "b"));
        }

        let recent = bus.recent(10);
        assert_eq!(recent.len(), 3);
        assert_eq!(recent[0].trigger, TransitionTrigger::ApplyValue(2));
        assert_eq!(recent[2].trigger, TransitionTrigger::ApplyValue(4));

        let last = bus.recent(1);
        assert_eq!(last[0].trigger, TransitionTrigger::ApplyValue(4));
    }

    #[test]
    fn test_for_command() {
        let bus = TransitionBus::new(8);
        let id = Uuid::new_v4();
        let mut tagged = event(TransitionTrigger::Post, "Idle", "WaitPreset");
        tagged.command_id = Some(id);
        bus.publish(tagged);
        bus.publish(event(TransitionTrigger::CarClid(1), "Idle", "Idle"));

        let found = bus.for_command(&id);
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].trigger, TransitionTrigger::Post);
    }
}
