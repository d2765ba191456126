// events.rs - Key Transition Events

//! Fire-and-forget notifications about key transitions.
//!
//! The transition engine publishes one [`TransitionEvent`] per key it actually
//! moved or deleted, after the filesystem change is durable. Delivery is best
//! effort: publish failures are logged and never undo a transition.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;

/// Tag carried by every key event
pub const KEY_EVENT_TAG: &str = "minion/key";

/// Errors raised by an event bus
#[derive(Debug, Error)]
pub enum BusError {
    #[error("No subscribers listening on {0}")]
    NoSubscribers(String),

    #[error("Publish failed: {0}")]
    PublishFailed(String),
}

/// Kind of transition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyAction {
    Accept,
    Reject,
    Delete,
}

impl KeyAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyAction::Accept => "accept",
            KeyAction::Reject => "reject",
            KeyAction::Delete => "delete",
        }
    }
}

/// Payload published for each mutated key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransitionEvent {
    pub result: bool,
    pub action: KeyAction,
    pub id: String,
}

impl TransitionEvent {
    pub fn new(action: KeyAction, id: impl Into<String>) -> Self {
        Self {
            result: true,
            action,
            id: id.into(),
        }
    }
}

/// Publish side of the event channel
pub trait EventBus: Send + Sync {
    fn publish(&self, event: &TransitionEvent, tag: &str) -> Result<(), BusError>;
}

/// An event together with the tag it was published under
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedEvent {
    pub tag: String,
    pub event: TransitionEvent,
}

/// In-process bus backed by a tokio broadcast channel
#[derive(Debug, Clone)]
pub struct BroadcastBus {
    sender: broadcast::Sender<TaggedEvent>,
}

impl BroadcastBus {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TaggedEvent> {
        self.sender.subscribe()
    }
}

impl Default for BroadcastBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl EventBus for BroadcastBus {
    fn publish(&self, event: &TransitionEvent, tag: &str) -> Result<(), BusError> {
        self.sender
            .send(TaggedEvent {
                tag: tag.to_string(),
                event: event.clone(),
            })
            .map(|_| ())
            .map_err(|_| BusError::NoSubscribers(tag.to_string()))
    }
}

/// Bus that drops everything
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBus;

impl EventBus for NullBus {
    fn publish(&self, _event: &TransitionEvent, _tag: &str) -> Result<(), BusError> {
        Ok(())
    }
}
