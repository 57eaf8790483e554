//! Turn orchestration
//!
//! A [`TurnOrchestrator`] runs the submission pipeline for one conversation:
//! wait for a free agent (interrupting it if needed), persist the user's
//! message, create the reply placeholder, stream the reply, and finalize or
//! roll back the placeholder.
//!
//! The placeholder is created unattached. A spawned task attaches it to the
//! conversation after the reveal delay so very fast replies never show up as
//! an empty message first. Completion and the reveal task coordinate through
//! a shared [`PendingSlot`].

use crate::agent::{Agent, TurnSlot};
use crate::config::OrchestratorConfig;
use crate::error::{ChannelError, LlamachatError, Result};
use crate::events::{ChatEvent, EventBus};
use crate::storage::{now, Message, SqliteStorage, USER_SPEAKER_ID};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Where the reply placeholder currently lives
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Placement {
    /// In memory only
    Detached,
    /// Persisted as part of the conversation
    Attached,
    /// Rolled back; must never be attached
    Discarded,
}

/// The reply placeholder of one turn
#[derive(Debug)]
struct PendingSlot {
    message: Message,
    placement: Placement,
}

type SharedSlot = Arc<Mutex<PendingSlot>>;

/// Result of a completed turn
#[derive(Debug, Clone)]
pub struct TurnOutcome {
    /// The user's message as submitted
    pub user_message: Message,
    /// The agent's finalized reply
    pub reply: Message,
    /// The reply was cut short by an interrupt
    pub interrupted: bool,
}

/// Submission pipeline over one agent and one conversation
pub struct TurnOrchestrator {
    agent: Arc<Agent>,
    store: Arc<SqliteStorage>,
    conversation_id: Uuid,
    config: OrchestratorConfig,
    temperature: Option<f64>,
    turn_gate: tokio::sync::Mutex<()>,
    pending: Mutex<Option<SharedSlot>>,
    view: Arc<Mutex<Vec<Message>>>,
    events: EventBus,
}

impl TurnOrchestrator {
    /// Create an orchestrator for an existing conversation
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if the conversation does not exist
    pub fn new(
        agent: Arc<Agent>,
        store: Arc<SqliteStorage>,
        conversation_id: Uuid,
        config: OrchestratorConfig,
    ) -> Result<Self> {
        if store.conversation(conversation_id)?.is_none() {
            return Err(
                LlamachatError::NotFound(format!("conversation {}", conversation_id)).into(),
            );
        }

        let messages = store.ordered_messages(conversation_id)?;
        let events = agent.events().clone();

        Ok(Self {
            agent,
            store,
            conversation_id,
            config,
            temperature: None,
            turn_gate: tokio::sync::Mutex::new(()),
            pending: Mutex::new(None),
            view: Arc::new(Mutex::new(messages)),
            events,
        })
    }

    /// Sampling temperature passed to every turn
    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Conversation this orchestrator drives
    pub fn conversation_id(&self) -> Uuid {
        self.conversation_id
    }

    /// Agent answering the turns
    pub fn agent(&self) -> &Arc<Agent> {
        &self.agent
    }

    /// Snapshot of the ordered messages
    pub fn messages(&self) -> Vec<Message> {
        lock(&self.view).clone()
    }

    /// The reply currently being produced, if any
    pub fn pending_message(&self) -> Option<Message> {
        lock(&self.pending)
            .as_ref()
            .map(|slot| lock(slot).message.clone())
    }

    /// Subscribe to chat events
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Submit user input and run the turn to completion
    ///
    /// If the agent is busy it is interrupted and the submission retried
    /// after the backoff, up to `max_interrupt_retries` times. The agent is
    /// claimed before anything is persisted.
    ///
    /// # Errors
    ///
    /// Returns `AgentBusy` when the agent never became free, channel errors
    /// after rolling back the placeholder, and any other agent failure.
    pub async fn submit(&self, input: &str) -> Result<TurnOutcome> {
        let (_turn, turn_slot) = self.acquire_turn().await?;

        info!(conversation = %self.conversation_id, "Submitting turn");
        let system_prompt = Some(self.agent.system_prompt());

        // Optimistic user message
        let mut user_message = Message::user(input).with_system_prompt(system_prompt.clone());
        user_message.conversation_id = Some(self.conversation_id);
        if let Err(e) = self.store.insert_message(&user_message) {
            warn!("Failed to persist user message: {}", e);
            lock(&self.view).push(user_message.clone());
        } else {
            self.refresh();
        }
        let history = self.messages();

        // Reply placeholder, revealed after a delay
        let slot: SharedSlot = Arc::new(Mutex::new(PendingSlot {
            message: Message::new(self.agent.id(), "").with_system_prompt(system_prompt),
            placement: Placement::Detached,
        }));
        *lock(&self.pending) = Some(Arc::clone(&slot));
        self.spawn_reveal(Arc::clone(&slot));

        let result = turn_slot
            .listen_think_respond(USER_SPEAKER_ID, &history, self.temperature)
            .await;

        match result {
            Ok(completion) => {
                let reply = {
                    let mut pending = lock(&slot);
                    pending.message.text = completion.text.clone();
                    pending.message.predicted_per_second = completion.predicted_per_second;
                    pending.message.response_start_seconds = completion.response_start_seconds;
                    pending.message.n_predicted = completion.n_predicted;
                    pending.message.model_name = completion.model_name.clone();
                    pending.message.updated_at = now();
                    self.persist_reply(&mut pending);
                    pending.message.clone()
                };

                // An empty reply stays designated until the next turn replaces it
                let partial = self.agent.partial_output();
                if !completion.text.is_empty()
                    && completion.text.starts_with(&partial)
                    && self.is_designated(&slot)
                {
                    lock(&self.pending).take();
                    self.agent.clear_partial_output();
                }

                self.refresh();
                debug!(
                    conversation = %self.conversation_id,
                    chars = reply.text.len(),
                    interrupted = completion.interrupted,
                    "Turn settled"
                );

                Ok(TurnOutcome {
                    user_message,
                    reply,
                    interrupted: completion.interrupted,
                })
            }
            Err(e) => {
                if let Some(channel_error) = e.downcast_ref::<ChannelError>() {
                    self.roll_back(&slot);
                    self.refresh();
                    warn!(conversation = %self.conversation_id, "Turn failed: {}", channel_error);
                    self.events.publish(ChatEvent::TurnFailed {
                        conversation_id: self.conversation_id,
                        message: channel_error.to_string(),
                        recovery_suggestion: channel_error.recovery_suggestion().to_string(),
                    });
                } else {
                    error!(conversation = %self.conversation_id, "Agent failed unexpectedly: {}", e);
                    let mut pending = lock(&slot);
                    if pending.placement == Placement::Detached {
                        pending.placement = Placement::Discarded;
                    }
                }
                Err(e)
            }
        }
    }

    /// Wait until this orchestrator holds the turn gate and a claim on the agent
    ///
    /// The agent may be shared with orchestrators of other conversations, so
    /// the claim itself is the readiness check.
    async fn acquire_turn(&self) -> Result<(tokio::sync::MutexGuard<'_, ()>, TurnSlot<'_>)> {
        let mut attempts = 0;
        loop {
            if let Ok(gate) = self.turn_gate.try_lock() {
                if let Ok(slot) = self.agent.begin_turn() {
                    return Ok((gate, slot));
                }
            }

            if attempts >= self.config.max_interrupt_retries {
                return Err(LlamachatError::AgentBusy(format!(
                    "agent {} still {} after {} interrupts",
                    self.agent.id(),
                    self.agent.status(),
                    attempts
                ))
                .into());
            }

            attempts += 1;
            debug!(attempt = attempts, "Agent busy, interrupting before retry");
            self.agent.interrupt();
            tokio::time::sleep(self.config.retry_backoff()).await;
        }
    }

    fn spawn_reveal(&self, slot: SharedSlot) {
        let store = Arc::clone(&self.store);
        let view = Arc::clone(&self.view);
        let events = self.events.clone();
        let conversation_id = self.conversation_id;
        let delay: Duration = self.config.reveal_delay();

        tokio::spawn(async move {
            tokio::time::sleep(delay).await;

            {
                let mut pending = lock(&slot);
                if pending.placement != Placement::Detached {
                    return;
                }
                match store.conversation(conversation_id) {
                    Ok(Some(_)) => {}
                    Ok(None) => {
                        pending.placement = Placement::Discarded;
                        return;
                    }
                    Err(e) => {
                        warn!("Failed to check conversation before reveal: {}", e);
                        return;
                    }
                }

                pending.message.conversation_id = Some(conversation_id);
                match store.insert_message(&pending.message) {
                    Ok(()) => pending.placement = Placement::Attached,
                    Err(e) => {
                        warn!("Failed to attach reply placeholder: {}", e);
                        return;
                    }
                }
            }

            refresh_view(&store, conversation_id, &view);
            events.publish(ChatEvent::MessagesChanged { conversation_id });
        });
    }

    /// Persist the finalized reply, attaching it if the reveal has not run
    fn persist_reply(&self, pending: &mut PendingSlot) {
        match pending.placement {
            Placement::Attached => match self.store.update_message(&pending.message) {
                Ok(true) => {}
                Ok(false) => warn!("Reply {} vanished from the store", pending.message.id),
                Err(e) => warn!("Failed to save reply: {}", e),
            },
            Placement::Detached => {
                pending.message.conversation_id = Some(self.conversation_id);
                match self.store.insert_message(&pending.message) {
                    Ok(()) => pending.placement = Placement::Attached,
                    Err(e) => {
                        warn!("Failed to save reply: {}", e);
                        lock(&self.view).push(pending.message.clone());
                    }
                }
            }
            Placement::Discarded => {
                debug!("Conversation gone, reply not persisted");
            }
        }
    }

    /// Remove the placeholder after a channel error
    fn roll_back(&self, slot: &SharedSlot) {
        {
            let mut pending = lock(slot);
            if pending.placement == Placement::Attached {
                if let Err(e) = self.store.delete_message(pending.message.id) {
                    warn!("Failed to delete reply placeholder: {}", e);
                }
            }
            pending.placement = Placement::Discarded;
        }

        if self.is_designated(slot) {
            lock(&self.pending).take();
        }
        self.agent.clear_partial_output();
    }

    fn is_designated(&self, slot: &SharedSlot) -> bool {
        lock(&self.pending)
            .as_ref()
            .map(|current| Arc::ptr_eq(current, slot))
            .unwrap_or(false)
    }

    /// Reload the ordered view from the store
    pub fn refresh(&self) {
        refresh_view(&self.store, self.conversation_id, &self.view);
        self.events.publish(ChatEvent::MessagesChanged {
            conversation_id: self.conversation_id,
        });
    }
}

fn refresh_view(store: &SqliteStorage, conversation_id: Uuid, view: &Mutex<Vec<Message>>) {
    match store.ordered_messages(conversation_id) {
        Ok(messages) => *lock(view) = messages,
        Err(e) => warn!("Failed to reload messages: {}", e),
    }
}
