//! Conversation and folder management
//!
//! [`ConversationManager`] is the context object a front-end holds: it owns
//! the agent, tracks the active conversation and its orchestrator, and keeps
//! a cached listing of root folders and conversations in sync with the moves
//! it performs.

use crate::agent::Agent;
use crate::config::{BackendConfig, Config};
use crate::error::{LlamachatError, Result};
use crate::events::{ChatEvent, EventBus};
use crate::orchestrator::TurnOrchestrator;
use crate::providers::{create_channel, CompletionChannel, ModelRef};
use crate::storage::{Conversation, Folder, RootItems, SqliteStorage};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Name given to folders created without one
pub const DEFAULT_FOLDER_NAME: &str = "New Folder";

/// Builds the completion channel for a model
pub type ChannelFactory =
    Arc<dyn Fn(&BackendConfig, &ModelRef) -> Result<Arc<dyn CompletionChannel>> + Send + Sync>;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn sort_root_items(items: &mut RootItems) {
    items.folders.sort_by(|a, b| a.name.cmp(&b.name));
    items
        .conversations
        .sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
}

/// The active conversation and the orchestrator driving it
struct Session {
    conversation: Conversation,
    orchestrator: Arc<TurnOrchestrator>,
}

/// Owns the agent and the active conversation
pub struct ConversationManager {
    store: Arc<SqliteStorage>,
    config: Config,
    channel_factory: ChannelFactory,
    events: EventBus,
    agent: Mutex<Arc<Agent>>,
    session: Mutex<Option<Session>>,
    root_items: Mutex<RootItems>,
    loading_model_id: Mutex<Option<String>>,
}

impl ConversationManager {
    /// Create a manager whose agent talks to the configured backend
    ///
    /// # Arguments
    ///
    /// * `store` - Conversation store
    /// * `config` - Application configuration
    /// * `channel_factory` - Builds a channel for a model
    ///
    /// # Errors
    ///
    /// Returns error if the first channel cannot be built or the root
    /// listing cannot be loaded
    pub fn new<F>(store: Arc<SqliteStorage>, config: Config, channel_factory: F) -> Result<Self>
    where
        F: Fn(&BackendConfig, &ModelRef) -> Result<Arc<dyn CompletionChannel>>
            + Send
            + Sync
            + 'static,
    {
        let channel_factory: ChannelFactory = Arc::new(channel_factory);
        let model = ModelRef::from_backend(&config.backend);
        let channel = channel_factory(&config.backend, &model)?;
        let events = EventBus::new();
        let agent = Arc::new(Agent::new(&config.agent, channel, events.clone()));

        let mut root_items = store.fetch_root_items()?;
        sort_root_items(&mut root_items);

        info!(model = %model, "Conversation manager ready");
        Ok(Self {
            store,
            config,
            channel_factory,
            events,
            agent: Mutex::new(agent),
            session: Mutex::new(None),
            root_items: Mutex::new(root_items),
            loading_model_id: Mutex::new(None),
        })
    }

    /// Create a manager using llama.cpp server channels
    ///
    /// # Errors
    ///
    /// Returns error if the HTTP client or the root listing fails
    pub fn with_llama_server(store: Arc<SqliteStorage>, config: Config) -> Result<Self> {
        Self::new(store, config, create_channel)
    }

    /// Store the manager works on
    pub fn store(&self) -> &Arc<SqliteStorage> {
        &self.store
    }

    /// Current agent
    pub fn agent(&self) -> Arc<Agent> {
        Arc::clone(&lock(&self.agent))
    }

    /// Subscribe to events of the current and future agents
    pub fn subscribe(&self) -> broadcast::Receiver<ChatEvent> {
        self.events.subscribe()
    }

    /// Model being swapped in by [`Self::reboot_agent`], if any
    pub fn loading_model_id(&self) -> Option<String> {
        lock(&self.loading_model_id).clone()
    }

    /// Active conversation
    pub fn current_conversation(&self) -> Option<Conversation> {
        lock(&self.session)
            .as_ref()
            .map(|session| session.conversation.clone())
    }

    /// Orchestrator of the active conversation
    pub fn orchestrator(&self) -> Option<Arc<TurnOrchestrator>> {
        lock(&self.session)
            .as_ref()
            .map(|session| Arc::clone(&session.orchestrator))
    }

    /// Cached root listing
    pub fn root_items(&self) -> RootItems {
        lock(&self.root_items).clone()
    }

    /// Reload the root listing from the store
    ///
    /// Folders are sorted by name, conversations by most recent message.
    pub fn fetch_root_items(&self) -> Result<RootItems> {
        let mut items = self.store.fetch_root_items()?;
        sort_root_items(&mut items);
        *lock(&self.root_items) = items.clone();
        Ok(items)
    }

    /// Start a fresh conversation and make it active
    ///
    /// Conversations without messages are deleted first, so at most one
    /// draft exists at a time.
    pub fn new_conversation(&self, folder_id: Option<Uuid>) -> Result<Conversation> {
        for draft in self.store.draft_conversations()? {
            debug!(conversation_id = %draft.id, "Deleting draft conversation");
            self.store.delete_conversation(draft.id)?;
            lock(&self.root_items)
                .conversations
                .retain(|c| c.id != draft.id);
        }

        let conversation = self.store.create_conversation(folder_id)?;
        if folder_id.is_none() {
            let mut items = lock(&self.root_items);
            items.conversations.push(conversation.clone());
            sort_root_items(&mut items);
        }

        self.set_current_conversation(conversation.id)?;
        info!(conversation_id = %conversation.id, "Started new conversation");
        Ok(conversation)
    }

    /// Create a folder with the default name
    pub fn new_folder(&self, parent_id: Option<Uuid>) -> Result<Folder> {
        self.create_folder(DEFAULT_FOLDER_NAME, parent_id)
    }

    /// Create a named folder under `parent_id`, or at the root
    pub fn create_folder(&self, name: &str, parent_id: Option<Uuid>) -> Result<Folder> {
        let folder = self.store.create_folder(name, parent_id)?;
        if parent_id.is_none() {
            let mut items = lock(&self.root_items);
            items.folders.push(folder.clone());
            sort_root_items(&mut items);
        }
        Ok(folder)
    }

    /// Move a conversation into `target`, or to the root
    pub fn move_conversation(&self, conversation_id: Uuid, target: Option<Uuid>) -> Result<()> {
        self.store.set_conversation_folder(conversation_id, target)?;
        let moved = self.require_conversation(conversation_id)?;

        {
            let mut items = lock(&self.root_items);
            items.conversations.retain(|c| c.id != conversation_id);
            if target.is_none() {
                items.conversations.push(moved.clone());
                sort_root_items(&mut items);
            }
        }

        let is_current = {
            let mut session = lock(&self.session);
            match session.as_mut() {
                Some(s) if s.conversation.id == conversation_id => {
                    s.conversation = moved;
                    true
                }
                _ => false,
            }
        };
        if is_current {
            // The folder chain, and with it the system prompt, may differ
            self.apply_system_prompt(conversation_id)?;
        }

        debug!(conversation_id = %conversation_id, target = ?target, "Moved conversation");
        Ok(())
    }

    /// Re-parent a folder
    ///
    /// # Errors
    ///
    /// Returns `FolderCycle` when `target` is the folder or a descendant
    pub fn move_folder(&self, folder_id: Uuid, target: Option<Uuid>) -> Result<()> {
        self.store.move_folder(folder_id, target)?;
        let moved = self
            .store
            .folder(folder_id)?
            .ok_or_else(|| LlamachatError::NotFound(format!("folder {}", folder_id)))?;

        let mut items = lock(&self.root_items);
        items.folders.retain(|f| f.id != folder_id);
        if target.is_none() {
            items.folders.push(moved);
            sort_root_items(&mut items);
        }
        Ok(())
    }

    /// Delete a conversation, deactivating it first when it is active
    pub fn delete_conversation(&self, conversation_id: Uuid) -> Result<bool> {
        let is_current = self
            .current_conversation()
            .is_some_and(|c| c.id == conversation_id);
        if is_current {
            self.unset_conversation();
        }

        let deleted = self.store.delete_conversation(conversation_id)?;
        lock(&self.root_items)
            .conversations
            .retain(|c| c.id != conversation_id);
        Ok(deleted)
    }

    /// Make a conversation active
    ///
    /// Applies the folder system-prompt override, primes the agent with the
    /// conversation's history and starts a warm-up in the background.
    pub fn set_current_conversation(&self, conversation_id: Uuid) -> Result<Arc<TurnOrchestrator>> {
        let conversation = self.require_conversation(conversation_id)?;
        let agent = self.agent();
        agent.interrupt();

        let system_prompt = self.effective_prompt(conversation_id)?;
        agent.set_system_prompt(&system_prompt);
        agent.prime(&self.store.ordered_messages(conversation_id)?);

        let orchestrator = Arc::new(
            TurnOrchestrator::new(
                Arc::clone(&agent),
                Arc::clone(&self.store),
                conversation_id,
                self.config.orchestrator.clone(),
            )?
            .with_temperature(self.config.agent.temperature),
        );

        *lock(&self.session) = Some(Session {
            conversation,
            orchestrator: Arc::clone(&orchestrator),
        });

        spawn_warmup(agent);
        debug!(conversation_id = %conversation_id, "Activated conversation");
        Ok(orchestrator)
    }

    /// Deactivate the current conversation
    pub fn unset_conversation(&self) {
        let agent = self.agent();
        agent.interrupt();
        agent.reset();
        lock(&self.session).take();
    }

    /// Replace the agent with one bound to `model`
    ///
    /// The current agent is interrupted and its channel shut down before the
    /// new channel is built. While the swap runs, [`Self::loading_model_id`]
    /// names the model. The active conversation, if any, is re-bound to the
    /// new agent.
    ///
    /// # Arguments
    ///
    /// * `system_prompt` - Prompt for the new agent; the configured one when `None`
    /// * `model` - Local model file or remote endpoint
    pub async fn reboot_agent(&self, system_prompt: Option<&str>, model: ModelRef) -> Result<()> {
        info!(model = %model, "Rebooting agent");
        *lock(&self.loading_model_id) = Some(model.id());

        let result = self.swap_agent(system_prompt, &model).await;
        lock(&self.loading_model_id).take();
        result
    }

    async fn swap_agent(&self, system_prompt: Option<&str>, model: &ModelRef) -> Result<()> {
        let old = self.agent();
        if let Err(e) = old.shutdown().await {
            warn!("Failed to shut down previous channel: {}", e);
        }

        let channel = (self.channel_factory)(&self.config.backend, model)?;
        let mut agent_config = self.config.agent.clone();
        if let Some(prompt) = system_prompt {
            agent_config.system_prompt = prompt.to_string();
        }
        let agent = Arc::new(Agent::new(&agent_config, channel, self.events.clone()));
        *lock(&self.agent) = agent;

        let current = self.current_conversation();
        if let Some(conversation) = current {
            self.set_current_conversation(conversation.id)?;
        }
        Ok(())
    }

    /// Stop the agent and release its channel
    pub async fn shutdown(&self) -> Result<()> {
        lock(&self.session).take();
        self.agent().shutdown().await
    }

    fn require_conversation(&self, id: Uuid) -> Result<Conversation> {
        self.store
            .conversation(id)?
            .ok_or_else(|| LlamachatError::NotFound(format!("conversation {}", id)).into())
    }

    fn effective_prompt(&self, conversation_id: Uuid) -> Result<String> {
        Ok(self
            .store
            .effective_system_prompt(conversation_id)?
            .unwrap_or_else(|| self.config.agent.system_prompt.clone()))
    }

    fn apply_system_prompt(&self, conversation_id: Uuid) -> Result<()> {
        let agent = self.agent();
        agent.set_system_prompt(&self.effective_prompt(conversation_id)?);
        agent.prime(&self.store.ordered_messages(conversation_id)?);
        Ok(())
    }
}

fn spawn_warmup(agent: Arc<Agent>) {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn(async move { agent.warmup().await });
        }
        Err(_) => debug!("No runtime, skipping warmup"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::AgentStatus;
    use crate::test_utils::{temp_storage, test_config, Script, ScriptedChannel};
    use std::path::PathBuf;
    use tempfile::TempDir;

    type Channels = Arc<Mutex<Vec<Arc<ScriptedChannel>>>>;

    fn manager() -> (ConversationManager, Channels, TempDir) {
        let (store, dir) = temp_storage();
        let channels: Channels = Arc::new(Mutex::new(Vec::new()));
        let created = Arc::clone(&channels);
        let manager = ConversationManager::new(Arc::new(store), test_config(), move |_, _| {
            let channel = Arc::new(ScriptedChannel::default());
            created.lock().unwrap().push(Arc::clone(&channel));
            Ok(channel as Arc<dyn CompletionChannel>)
        })
        .unwrap();
        (manager, channels, dir)
    }

    #[test]
    fn test_new_conversation_deletes_drafts() {
        let (manager, _, _dir) = manager();
        let first = manager.new_conversation(None).unwrap();
        let second = manager.new_conversation(None).unwrap();

        assert!(manager.store().conversation(first.id).unwrap().is_none());
        assert_eq!(manager.current_conversation().unwrap().id, second.id);
        let roots = manager.root_items();
        assert_eq!(roots.conversations.len(), 1);
        assert_eq!(roots.conversations[0].id, second.id);
    }

    #[test]
    fn test_new_conversation_keeps_conversations_with_messages() {
        let (manager, _, _dir) = manager();
        let first = manager.new_conversation(None).unwrap();
        manager
            .store()
            .append_message(first.id, "user", "hello", None)
            .unwrap();

        manager.new_conversation(None).unwrap();
        assert!(manager.store().conversation(first.id).unwrap().is_some());
        assert_eq!(manager.fetch_root_items().unwrap().conversations.len(), 2);
    }

    #[test]
    fn test_create_folder_updates_root_listing() {
        let (manager, _, _dir) = manager();
        let work = manager.create_folder("Work", None).unwrap();
        let inbox = manager.new_folder(None).unwrap();
        manager.create_folder("Nested", Some(work.id)).unwrap();

        let names: Vec<String> = manager
            .root_items()
            .folders
            .into_iter()
            .map(|f| f.name)
            .collect();
        assert_eq!(names, vec![inbox.name, "Work".to_string()]);
        assert_eq!(manager.root_items().folders, manager.fetch_root_items().unwrap().folders);
    }

    #[test]
    fn test_move_conversation_maintains_root_listing() {
        let (manager, _, _dir) = manager();
        let folder = manager.create_folder("Archive", None).unwrap();
        let conversation = manager.new_conversation(None).unwrap();

        manager
            .move_conversation(conversation.id, Some(folder.id))
            .unwrap();
        assert!(manager.root_items().conversations.is_empty());
        assert_eq!(
            manager.current_conversation().unwrap().folder_id,
            Some(folder.id)
        );

        manager.move_conversation(conversation.id, None).unwrap();
        assert_eq!(manager.root_items().conversations.len(), 1);
        assert_eq!(manager.root_items(), manager.fetch_root_items().unwrap());
    }

    #[test]
    fn test_move_folder_rejects_cycles() {
        let (manager, _, _dir) = manager();
        let parent = manager.create_folder("Parent", None).unwrap();
        let child = manager.create_folder("Child", Some(parent.id)).unwrap();

        let err = manager.move_folder(parent.id, Some(child.id)).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<LlamachatError>(),
            Some(LlamachatError::FolderCycle(_))
        ));

        manager.move_folder(child.id, None).unwrap();
        assert_eq!(manager.root_items().folders.len(), 2);
    }

    #[tokio::test]
    async fn test_set_current_conversation_applies_folder_prompt() {
        let (manager, _, _dir) = manager();
        let folder = manager.create_folder("Poems", None).unwrap();
        manager
            .store()
            .set_folder_sys_prompt(folder.id, Some("Answer in verse."))
            .unwrap();
        let conversation = manager.store().create_conversation(Some(folder.id)).unwrap();
        manager
            .store()
            .append_message(conversation.id, "user", "hi", None)
            .unwrap();

        manager.set_current_conversation(conversation.id).unwrap();

        let agent = manager.agent();
        assert_eq!(agent.system_prompt(), "Answer in verse.");
        assert_eq!(agent.prompt(), "Answer in verse.\nuser: hi\n");
        assert_eq!(
            manager.orchestrator().unwrap().conversation_id(),
            conversation.id
        );
    }

    #[test]
    fn test_root_conversation_uses_configured_prompt() {
        let (manager, _, _dir) = manager();
        manager.new_conversation(None).unwrap();
        assert_eq!(manager.agent().system_prompt(), "You are a test assistant.");
    }

    #[test]
    fn test_set_current_conversation_unknown_id() {
        let (manager, _, _dir) = manager();
        assert!(manager.set_current_conversation(Uuid::new_v4()).is_err());
        assert!(manager.current_conversation().is_none());
    }

    #[test]
    fn test_unset_and_delete_conversation() {
        let (manager, _, _dir) = manager();
        let conversation = manager.new_conversation(None).unwrap();

        assert!(manager.delete_conversation(conversation.id).unwrap());
        assert!(manager.current_conversation().is_none());
        assert!(manager.orchestrator().is_none());
        assert!(manager.root_items().conversations.is_empty());
        assert_eq!(manager.agent().prompt(), "");
    }

    #[tokio::test]
    async fn test_reboot_agent_replaces_channel() {
        let (manager, channels, _dir) = manager();
        let conversation = manager.new_conversation(None).unwrap();
        let before = manager.agent();

        manager
            .reboot_agent(
                Some("Rebooted."),
                ModelRef::Local(PathBuf::from("/models/other.gguf")),
            )
            .await
            .unwrap();

        let after = manager.agent();
        assert!(!Arc::ptr_eq(&before, &after));
        assert_eq!(channels.lock().unwrap().len(), 2);
        assert_eq!(channels.lock().unwrap()[0].shutdown_count(), 1);
        assert!(manager.loading_model_id().is_none());
        assert_eq!(
            manager.orchestrator().unwrap().conversation_id(),
            conversation.id
        );
        assert!(Arc::ptr_eq(manager.orchestrator().unwrap().agent(), &after));
    }

    #[tokio::test]
    async fn test_reboot_agent_failure_clears_loading_model() {
        let (store, _dir) = temp_storage();
        let calls = Arc::new(Mutex::new(0));
        let counter = Arc::clone(&calls);
        let manager = ConversationManager::new(Arc::new(store), test_config(), move |_, _| {
            let mut n = counter.lock().unwrap();
            *n += 1;
            if *n > 1 {
                return Err(LlamachatError::Config("no such model".to_string()).into());
            }
            Ok(Arc::new(ScriptedChannel::default()) as Arc<dyn CompletionChannel>)
        })
        .unwrap();

        let result = manager
            .reboot_agent(None, ModelRef::Local(PathBuf::from("/missing.gguf")))
            .await;
        assert!(result.is_err());
        assert!(manager.loading_model_id().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_submit_through_active_conversation() {
        let (store, _dir) = temp_storage();
        let manager = ConversationManager::new(Arc::new(store), test_config(), |_, _| {
            // The background warm-up may take either script
            Ok(Arc::new(ScriptedChannel::new(vec![
                Script::reply(&["Hello", "!"]),
                Script::reply(&["Hello", "!"]),
            ])) as Arc<dyn CompletionChannel>)
        })
        .unwrap();

        manager.new_conversation(None).unwrap();
        let orchestrator = manager.orchestrator().unwrap();
        let outcome = orchestrator.submit("hi").await.unwrap();

        assert_eq!(outcome.reply.text, "Hello!");
        assert_eq!(manager.agent().status(), AgentStatus::Ready);
        let conversation = manager.current_conversation().unwrap();
        assert_eq!(
            manager.store().conversation_title(conversation.id).unwrap(),
            "hi"
        );
    }
}
