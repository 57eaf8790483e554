//! Agent core implementation
//!
//! An agent owns one conversational identity's running prompt, the live
//! partial output of the reply being streamed, and its status. It drives at
//! most one completion stream at a time.

use crate::config::AgentConfig;
use crate::error::{LlamachatError, Result};
use crate::events::{ChatEvent, EventBus};
use crate::providers::{ChannelOptions, CompletionChannel, CompletionResult};
use crate::storage::Message;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the agent is doing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentStatus {
    /// Idle and able to start a turn
    Ready,
    /// Pre-loading server state with a non-displayed completion
    WarmingUp,
    /// Streaming a reply
    Processing,
}

impl fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Ready => "ready",
            Self::WarmingUp => "warming up",
            Self::Processing => "processing",
        };
        f.write_str(label)
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Render one transcript entry the way turns are appended to the running prompt
fn render_message(prompt: &mut String, message: &Message) {
    if message.is_from_user() {
        prompt.push_str(&format!("\n{}: {}\n", message.from_id, message.text));
    } else if !message.text.is_empty() {
        prompt.push_str(&format!("{}: {}", message.from_id, message.text));
    }
}

/// A conversational identity bound to one completion channel
///
/// All state sits behind short-lived mutexes so an `Arc<Agent>` can be
/// shared between the task streaming a reply and callers that interrupt it
/// or read its partial output.
///
/// # Examples
///
/// ```ignore
/// use llamachat::agent::Agent;
/// use llamachat::config::AgentConfig;
/// use llamachat::events::EventBus;
///
/// # async fn example(channel: std::sync::Arc<dyn llamachat::providers::CompletionChannel>) -> llamachat::error::Result<()> {
/// let agent = Agent::new(&AgentConfig::default(), channel, EventBus::new());
/// let history = vec![llamachat::storage::Message::user("hello")];
/// let reply = agent.listen_think_respond("user", &history, None).await?;
/// println!("{}", reply.text);
/// # Ok(())
/// # }
/// ```
pub struct Agent {
    id: String,
    system_prompt: Mutex<String>,
    prompt: Mutex<RunningPrompt>,
    partial: Mutex<String>,
    status: Mutex<AgentStatus>,
    in_flight: Mutex<Option<CancellationToken>>,
    channel: Arc<dyn CompletionChannel>,
    options: ChannelOptions,
    events: EventBus,
}

/// Running prompt and the priming it belongs to
///
/// Priming bumps `epoch`; a stream only writes back into the prompt it
/// started from.
#[derive(Debug, Default)]
struct RunningPrompt {
    text: String,
    epoch: u64,
}

/// Exclusive claim on the agent's single stream
///
/// Holding a slot keeps every other turn or warm-up out. The agent returns
/// to `Ready` when the slot is dropped, however the stream ended.
pub struct TurnSlot<'a> {
    agent: &'a Agent,
    token: CancellationToken,
}

impl TurnSlot<'_> {
    /// Run the claimed turn; see [`Agent::listen_think_respond`]
    ///
    /// # Errors
    ///
    /// Returns `NotFound` if `history` is empty and channel errors unchanged
    pub async fn listen_think_respond(
        self,
        speaker_id: &str,
        history: &[Message],
        temperature: Option<f64>,
    ) -> Result<CompletionResult> {
        self.agent
            .respond(&self.token, speaker_id, history, temperature)
            .await
    }
}

impl Drop for TurnSlot<'_> {
    fn drop(&mut self) {
        lock(&self.agent.in_flight).take();
        self.agent.set_status(AgentStatus::Ready);
    }
}

impl Agent {
    /// Creates a new agent
    ///
    /// # Arguments
    ///
    /// * `config` - Agent identity, system prompt and context length
    /// * `channel` - Channel used for every completion
    /// * `events` - Bus receiving status and partial-output events
    pub fn new(config: &AgentConfig, channel: Arc<dyn CompletionChannel>, events: EventBus) -> Self {
        Self {
            id: config.id.clone(),
            system_prompt: Mutex::new(config.system_prompt.clone()),
            prompt: Mutex::new(RunningPrompt::default()),
            partial: Mutex::new(String::new()),
            status: Mutex::new(AgentStatus::Ready),
            in_flight: Mutex::new(None),
            channel,
            options: ChannelOptions::new(config.context_length),
            events,
        }
    }

    /// Speaker id of the agent
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current status
    pub fn status(&self) -> AgentStatus {
        *lock(&self.status)
    }

    /// Channel the agent streams through
    pub fn channel(&self) -> Arc<dyn CompletionChannel> {
        Arc::clone(&self.channel)
    }

    /// Bus the agent publishes on
    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// System prompt seeded into an empty running prompt
    pub fn system_prompt(&self) -> String {
        lock(&self.system_prompt).clone()
    }

    /// Replace the system prompt used for the next seeding
    pub fn set_system_prompt(&self, system_prompt: &str) {
        *lock(&self.system_prompt) = system_prompt.to_string();
    }

    /// Full running prompt
    pub fn prompt(&self) -> String {
        lock(&self.prompt).text.clone()
    }

    /// Text streamed so far for the current or last reply
    pub fn partial_output(&self) -> String {
        lock(&self.partial).clone()
    }

    /// Forget the streamed text of the last reply
    pub fn clear_partial_output(&self) {
        lock(&self.partial).clear();
    }

    /// Reseed the running prompt from a conversation's history
    ///
    /// A stream still in flight keeps running but no longer writes into the
    /// running prompt, so its late deltas cannot leak into the new one.
    pub fn prime(&self, history: &[Message]) {
        let seeded = self.seed(history);
        debug!(agent = %self.id, messages = history.len(), "Primed running prompt");
        self.replace_prompt(seeded);
    }

    /// Clear the running prompt and partial output
    pub fn reset(&self) {
        self.replace_prompt(String::new());
        lock(&self.partial).clear();
    }

    fn replace_prompt(&self, text: String) {
        let mut prompt = lock(&self.prompt);
        prompt.text = text;
        prompt.epoch += 1;
    }

    fn seed(&self, history: &[Message]) -> String {
        let mut prompt = self.system_prompt();
        for message in history {
            render_message(&mut prompt, message);
        }
        prompt
    }

    fn set_status(&self, status: AgentStatus) {
        let changed = {
            let mut current = lock(&self.status);
            let changed = *current != status;
            *current = status;
            changed
        };
        if changed {
            self.events.publish(ChatEvent::StatusChanged {
                agent_id: self.id.clone(),
                status,
            });
        }
    }

    /// Claim the single stream slot and switch to `status`
    fn begin(&self, status: AgentStatus) -> Result<TurnSlot<'_>> {
        let token = {
            let mut in_flight = lock(&self.in_flight);
            if in_flight.is_some() {
                return Err(LlamachatError::AgentBusy(format!(
                    "agent {} is {}",
                    self.id,
                    self.status()
                ))
                .into());
            }
            let token = CancellationToken::new();
            *in_flight = Some(token.clone());
            token
        };
        self.set_status(status);
        Ok(TurnSlot { agent: self, token })
    }

    /// Claim the agent for a turn without starting it
    ///
    /// # Errors
    ///
    /// Returns `AgentBusy` if a turn or warm-up is in flight
    pub fn begin_turn(&self) -> Result<TurnSlot<'_>> {
        self.begin(AgentStatus::Processing)
    }

    /// Run one turn: render the latest message into the prompt and stream a reply
    ///
    /// The last entry of `history` is the message being answered. When the
    /// running prompt is empty it is first seeded with the system prompt and
    /// the entries before it.
    ///
    /// # Errors
    ///
    /// Returns `AgentBusy` if a stream is already in flight, `NotFound` if
    /// `history` is empty, and channel errors unchanged. The agent is
    /// `Ready` again whenever this returns.
    pub async fn listen_think_respond(
        &self,
        speaker_id: &str,
        history: &[Message],
        temperature: Option<f64>,
    ) -> Result<CompletionResult> {
        self.begin_turn()?
            .listen_think_respond(speaker_id, history, temperature)
            .await
    }

    async fn respond(
        &self,
        token: &CancellationToken,
        speaker_id: &str,
        history: &[Message],
        temperature: Option<f64>,
    ) -> Result<CompletionResult> {
        let (latest, earlier) = history.split_last().ok_or_else(|| {
            LlamachatError::NotFound("a message for the agent to answer".to_string())
        })?;

        let (prompt, rollback_len, epoch) = {
            let mut running = lock(&self.prompt);
            let rollback_len = running.text.len();
            if running.text.is_empty() {
                running.text = self.seed(earlier);
            }
            running
                .text
                .push_str(&format!("\n{}: {}\n", speaker_id, latest.text));
            running.text.push_str(&format!("{}: ", self.id));
            (running.text.clone(), rollback_len, running.epoch)
        };
        self.clear_partial_output();

        let on_partial = |delta: &str| {
            {
                let mut running = lock(&self.prompt);
                if running.epoch == epoch {
                    running.text.push_str(delta);
                }
            }
            lock(&self.partial).push_str(delta);
            self.events.publish(ChatEvent::PartialOutput {
                agent_id: self.id.clone(),
                delta: delta.to_string(),
            });
        };

        let options = self.options.clone().with_temperature(temperature);
        debug!(agent = %self.id, prompt_len = prompt.len(), "Starting turn");

        match self
            .channel
            .stream(&prompt, &options, &on_partial, token.clone())
            .await
        {
            Ok(result) => {
                if result.interrupted {
                    info!(agent = %self.id, chars = result.text.len(), "Turn interrupted");
                }
                Ok(result)
            }
            Err(e) => {
                // The failed turn must not leak into the next prompt
                let mut running = lock(&self.prompt);
                if running.epoch == epoch {
                    running.text.truncate(rollback_len);
                }
                Err(e)
            }
        }
    }

    /// Request cancellation of the in-flight stream
    ///
    /// Returns whether a stream was signalled. Never waits for it to stop.
    pub fn interrupt(&self) -> bool {
        let signalled = match lock(&self.in_flight).as_ref() {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };

        if signalled {
            debug!(agent = %self.id, "Interrupt requested");
            self.events.publish(ChatEvent::InterruptRequested {
                agent_id: self.id.clone(),
            });
        }
        signalled
    }

    /// Pre-load server state for the running prompt
    ///
    /// Does nothing when the prompt is empty or a stream is in flight.
    /// Failures are logged and swallowed.
    pub async fn warmup(&self) {
        let prompt = self.prompt();
        if prompt.is_empty() {
            return;
        }

        let slot = match self.begin(AgentStatus::WarmingUp) {
            Ok(claimed) => claimed,
            Err(_) => {
                debug!(agent = %self.id, "Skipping warmup, agent is busy");
                return;
            }
        };

        let options = self.options.for_warmup();
        match self
            .channel
            .stream(&prompt, &options, &|_: &str| {}, slot.token.clone())
            .await
        {
            Ok(_) => debug!(agent = %self.id, "Warmup complete"),
            Err(e) => warn!(agent = %self.id, "Failed to warm up server: {}", e),
        }
    }

    /// Stop any stream and release the channel
    pub async fn shutdown(&self) -> Result<()> {
        self.interrupt();
        self.channel.shutdown().await
    }
}

impl fmt::Debug for Agent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Agent")
            .field("id", &self.id)
            .field("status", &self.status())
            .field("context_length", &self.options.context_length)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ChannelError;
    use crate::storage::USER_SPEAKER_ID;
    use crate::test_utils::{Script, ScriptedChannel};
    use std::time::Duration;

    fn config() -> AgentConfig {
        AgentConfig {
            system_prompt: "SYS".to_string(),
            ..AgentConfig::default()
        }
    }

    fn agent_with(channel: Arc<ScriptedChannel>) -> Arc<Agent> {
        Arc::new(Agent::new(&config(), channel, EventBus::new()))
    }

    fn assistant(text: &str) -> Message {
        Message::new("Llama", text)
    }

    #[tokio::test]
    async fn test_first_turn_seeds_prompt_and_streams() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::reply(&["Hel", "lo"])]));
        let agent = agent_with(Arc::clone(&channel));

        let result = agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("hi")], None)
            .await
            .unwrap();

        assert_eq!(result.text, "Hello");
        assert_eq!(channel.prompts(), vec!["SYS\nuser: hi\nLlama: "]);
        assert_eq!(agent.prompt(), "SYS\nuser: hi\nLlama: Hello");
        assert_eq!(agent.partial_output(), "Hello");
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_seed_includes_earlier_history() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::reply(&["4"])]));
        let agent = agent_with(Arc::clone(&channel));
        let history = vec![
            Message::user("2+2?"),
            assistant("4"),
            Message::user("and 2+3?"),
        ];

        agent
            .listen_think_respond(USER_SPEAKER_ID, &history, Some(0.5))
            .await
            .unwrap();

        assert_eq!(
            channel.prompts()[0],
            "SYS\nuser: 2+2?\nLlama: 4\nuser: and 2+3?\nLlama: "
        );
        assert_eq!(channel.options()[0].temperature, Some(0.5));
    }

    #[tokio::test]
    async fn test_second_turn_appends_only_latest_message() {
        let channel = Arc::new(ScriptedChannel::new(vec![
            Script::reply(&["A"]),
            Script::reply(&["B"]),
        ]));
        let agent = agent_with(Arc::clone(&channel));

        agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("one")], None)
            .await
            .unwrap();
        let history = vec![Message::user("one"), assistant("A"), Message::user("two")];
        agent
            .listen_think_respond(USER_SPEAKER_ID, &history, None)
            .await
            .unwrap();

        assert_eq!(channel.prompts()[1], "SYS\nuser: one\nLlama: A\nuser: two\nLlama: ");
        assert_eq!(agent.partial_output(), "B");
    }

    #[tokio::test]
    async fn test_partial_output_events_in_order() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::reply(&["a", "b", "c"])]));
        let agent = agent_with(channel);
        let mut rx = agent.events().subscribe();

        agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("x")], None)
            .await
            .unwrap();

        let mut deltas = Vec::new();
        let mut statuses = Vec::new();
        while let Ok(event) = rx.try_recv() {
            match event {
                ChatEvent::PartialOutput { delta, .. } => deltas.push(delta),
                ChatEvent::StatusChanged { status, .. } => statuses.push(status),
                _ => {}
            }
        }
        assert_eq!(deltas, vec!["a", "b", "c"]);
        assert_eq!(statuses, vec![AgentStatus::Processing, AgentStatus::Ready]);
    }

    #[tokio::test]
    async fn test_channel_error_propagates_and_resets_status() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::fail(
            &["par"],
            ChannelError::Unreachable("connection reset".to_string()),
        )]));
        let agent = agent_with(channel);

        let err = agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("hi")], None)
            .await
            .unwrap_err();

        assert!(matches!(
            err.downcast_ref::<ChannelError>(),
            Some(ChannelError::Unreachable(_))
        ));
        assert_eq!(agent.status(), AgentStatus::Ready);
        assert_eq!(agent.prompt(), "");
    }

    #[tokio::test]
    async fn test_empty_history_is_rejected() {
        let agent = agent_with(Arc::new(ScriptedChannel::default()));
        let err = agent
            .listen_think_respond(USER_SPEAKER_ID, &[], None)
            .await
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlamachatError>(),
            Some(LlamachatError::NotFound(_))
        ));
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_second_stream_while_processing_is_busy_until_interrupted() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::hang(&["long"])]));
        let agent = agent_with(channel);

        let running = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .listen_think_respond(USER_SPEAKER_ID, &[Message::user("go")], None)
                    .await
            })
        };
        while agent.status() != AgentStatus::Processing {
            tokio::task::yield_now().await;
        }

        let busy = agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("again")], None)
            .await
            .unwrap_err();
        assert!(matches!(
            busy.downcast_ref::<LlamachatError>(),
            Some(LlamachatError::AgentBusy(_))
        ));

        assert!(agent.interrupt());
        let result = running.await.unwrap().unwrap();
        assert!(result.interrupted);
        assert_eq!(result.text, "long");
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_held_turn_slot_keeps_other_turns_out() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::reply(&["ok"])]));
        let agent = agent_with(Arc::clone(&channel));

        let slot = agent.begin_turn().unwrap();
        assert_eq!(agent.status(), AgentStatus::Processing);
        let busy = agent
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("hi")], None)
            .await
            .unwrap_err();
        assert!(matches!(
            busy.downcast_ref::<LlamachatError>(),
            Some(LlamachatError::AgentBusy(_))
        ));
        assert_eq!(channel.call_count(), 0);

        let result = slot
            .listen_think_respond(USER_SPEAKER_ID, &[Message::user("hi")], None)
            .await
            .unwrap();
        assert_eq!(result.text, "ok");
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test(start_paused = true)]
    async fn test_prime_detaches_stream_in_flight() {
        let channel = Arc::new(
            ScriptedChannel::new(vec![Script::reply(&["a", "b", "c"])])
                .with_step_delay(Duration::from_millis(100)),
        );
        let agent = agent_with(channel);

        let running = {
            let agent = Arc::clone(&agent);
            tokio::spawn(async move {
                agent
                    .listen_think_respond(USER_SPEAKER_ID, &[Message::user("old")], None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(agent.prompt(), "SYS\nuser: old\nLlama: a");

        agent.prime(&[Message::user("new"), assistant("fresh")]);
        let result = running.await.unwrap().unwrap();

        assert_eq!(result.text, "abc");
        assert_eq!(agent.prompt(), "SYS\nuser: new\nLlama: fresh");
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_interrupt_when_idle_is_a_noop() {
        let agent = agent_with(Arc::new(ScriptedChannel::default()));
        let mut rx = agent.events().subscribe();
        assert!(!agent.interrupt());
        assert!(!agent.interrupt());
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_warmup_skips_empty_prompt() {
        let channel = Arc::new(ScriptedChannel::default());
        let agent = agent_with(Arc::clone(&channel));
        agent.warmup().await;
        assert_eq!(channel.call_count(), 0);
    }

    #[tokio::test]
    async fn test_warmup_predicts_nothing_and_keeps_prompt() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::reply(&["ignored"])]));
        let agent = agent_with(Arc::clone(&channel));
        agent.prime(&[Message::user("hello")]);
        let before = agent.prompt();

        agent.warmup().await;

        assert_eq!(channel.options()[0].n_predict, Some(0));
        assert_eq!(channel.prompts()[0], before);
        assert_eq!(agent.prompt(), before);
        assert_eq!(agent.partial_output(), "");
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_warmup_failure_is_swallowed() {
        let channel = Arc::new(ScriptedChannel::new(vec![Script::fail(
            &[],
            ChannelError::Timeout("slow".to_string()),
        )]));
        let agent = agent_with(channel);
        agent.prime(&[Message::user("hello")]);

        agent.warmup().await;
        assert_eq!(agent.status(), AgentStatus::Ready);
    }

    #[tokio::test]
    async fn test_warmup_reports_warming_up_status() {
        let channel = Arc::new(
            ScriptedChannel::new(vec![Script::reply(&["x"])])
                .with_step_delay(Duration::from_millis(50)),
        );
        let agent = agent_with(channel);
        agent.prime(&[Message::user("hello")]);
        let mut rx = agent.events().subscribe();

        agent.warmup().await;

        let statuses: Vec<AgentStatus> = std::iter::from_fn(|| rx.try_recv().ok())
            .filter_map(|e| match e {
                ChatEvent::StatusChanged { status, .. } => Some(status),
                _ => None,
            })
            .collect();
        assert_eq!(statuses, vec![AgentStatus::WarmingUp, AgentStatus::Ready]);
    }

    #[test]
    fn test_prime_and_reset() {
        let agent = agent_with(Arc::new(ScriptedChannel::default()));
        agent.prime(&[Message::user("q"), assistant("a"), assistant("")]);
        assert_eq!(agent.prompt(), "SYS\nuser: q\nLlama: a");

        agent.set_system_prompt("NEW");
        agent.reset();
        assert_eq!(agent.prompt(), "");
        agent.prime(&[]);
        assert_eq!(agent.prompt(), "NEW");
    }

    #[tokio::test]
    async fn test_shutdown_releases_channel() {
        let channel = Arc::new(ScriptedChannel::default());
        let agent = agent_with(Arc::clone(&channel));
        agent.shutdown().await.unwrap();
        assert_eq!(channel.shutdown_count(), 1);
    }
}
