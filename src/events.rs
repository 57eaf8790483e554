//! Chat events published to front-ends
//!
//! Agents and orchestrators publish [`ChatEvent`]s on a tokio broadcast
//! channel. Subscribers that fall behind lose the oldest events; publishing
//! never blocks and never fails when nobody listens.

use crate::agent::AgentStatus;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Events buffered per subscriber before the oldest are dropped
const EVENT_CAPACITY: usize = 256;

/// Something a front-end may want to redraw for
#[derive(Debug, Clone, PartialEq)]
pub enum ChatEvent {
    /// The agent moved to a new status
    StatusChanged {
        /// Agent id
        agent_id: String,
        /// New status
        status: AgentStatus,
    },
    /// A streamed delta was appended to the agent's partial output
    PartialOutput {
        /// Agent id
        agent_id: String,
        /// The new text
        delta: String,
    },
    /// An in-flight stream was asked to stop
    InterruptRequested {
        /// Agent id
        agent_id: String,
    },
    /// The ordered messages of a conversation changed
    MessagesChanged {
        /// Conversation id
        conversation_id: Uuid,
    },
    /// A turn failed with a channel error
    TurnFailed {
        /// Conversation id
        conversation_id: Uuid,
        /// Error text
        message: String,
        /// Hint for the user
        recovery_suggestion: String,
    },
}

/// Cloneable handle to a broadcast channel of [`ChatEvent`]s
#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<ChatEvent>,
}

impl EventBus {
    /// Create a bus with the default capacity
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(EVENT_CAPACITY);
        Self { sender }
    }

    /// Publish an event to current subscribers
    pub fn publish(&self, event: ChatEvent) {
        // Err only means nobody is subscribed
        let _ = self.sender.send(event);
    }

    /// Receive events published from now on
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.sender.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
