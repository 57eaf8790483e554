/*!
Command handlers for the CLI

This module provides command handlers invoked by the CLI entrypoint:

- `chat`     — Interactive chat over the active conversation
- `history`  — Conversation listing and management
- `folders`  — Folder tree management

The handlers only call library operations: the conversation manager, the
turn orchestrator, and the store.
*/

use crate::error::Result;
use crate::storage::SqliteStorage;
use chrono::{DateTime, Local, Utc};

pub mod folders;
pub mod history;
pub mod special_commands;

/// Format a timestamp for tables in local time
pub(crate) fn format_timestamp(at: &DateTime<Utc>) -> String {
    at.with_timezone(&Local).format("%Y-%m-%d %H:%M").to_string()
}

/// First eight characters of an id, enough to resolve it again
pub(crate) fn short_id(id: &uuid::Uuid) -> String {
    id.to_string()[..8].to_string()
}

/// Open the store for a command
pub(crate) fn open_store(config: &crate::config::Config) -> Result<SqliteStorage> {
    SqliteStorage::from_config(&config.storage)
}

// Chat command handler
pub mod chat {
    //! Interactive chat handler.
    //!
    //! Builds a `ConversationManager` over the configured server, activates
    //! a conversation, and runs a readline loop that submits user input
    //! through the turn orchestrator while streaming the reply.

    use super::special_commands::{parse_special_command, print_help, SpecialCommand};
    use super::*;
    use crate::config::Config;
    use crate::error::ChannelError;
    use crate::events::ChatEvent;
    use crate::manager::ConversationManager;
    use crate::providers::ModelRef;
    use crate::storage::Message;
    use colored::Colorize;
    use rustyline::error::ReadlineError;
    use rustyline::DefaultEditor;
    use std::io::Write;
    use std::sync::Arc;
    use tokio::sync::broadcast::error::RecvError;

    /// Start interactive chat
    ///
    /// # Arguments
    ///
    /// * `config` - Global configuration (consumed)
    /// * `conversation` - Conversation to resume (id or id prefix)
    /// * `folder` - Folder for the new conversation (id or id prefix)
    /// * `temperature` - Sampling temperature override
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::commands::chat;
    /// use llamachat::config::Config;
    ///
    /// // In application code:
    /// // chat::run_chat(Config::default(), None, None, None).await?;
    /// ```
    pub async fn run_chat(
        mut config: Config,
        conversation: Option<String>,
        folder: Option<String>,
        temperature: Option<f64>,
    ) -> Result<()> {
        if temperature.is_some() {
            config.agent.temperature = temperature;
            config.validate()?;
        }

        let store = Arc::new(open_store(&config)?);
        let mut model = ModelRef::from_backend(&config.backend);
        let manager = ConversationManager::with_llama_server(Arc::clone(&store), config)?;

        if let Err(e) = manager.agent().channel().health_check().await {
            print_error(&e);
        }

        match (conversation, folder) {
            (Some(id), _) => {
                let conversation = store.resolve_conversation(&id)?;
                manager.set_current_conversation(conversation.id)?;
            }
            (None, Some(id)) => {
                let folder = store.resolve_folder(&id)?;
                manager.new_conversation(Some(folder.id))?;
            }
            (None, None) => {
                manager.new_conversation(None)?;
            }
        }

        let mut rl = DefaultEditor::new()?;
        print_welcome_banner(&model);
        print_transcript(&manager)?;

        loop {
            let prompt = format!("{} ", "you>".green().bold());
            match rl.readline(&prompt) {
                Ok(line) => {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    rl.add_history_entry(trimmed)?;

                    let command = match parse_special_command(trimmed) {
                        Ok(command) => command,
                        Err(e) => {
                            println!("{}\n", e.to_string().red());
                            continue;
                        }
                    };

                    // Session commands report their own failures and keep the loop alive
                    let result = match command {
                        SpecialCommand::None => submit_turn(&manager, trimmed).await,
                        SpecialCommand::Exit => break,
                        SpecialCommand::Help => {
                            print_help();
                            Ok(())
                        }
                        SpecialCommand::NewConversation => {
                            manager.new_conversation(None).map(|c| {
                                println!("Started conversation {}\n", short_id(&c.id).cyan());
                            })
                        }
                        SpecialCommand::Open(id) => open_conversation(&manager, &id),
                        SpecialCommand::ListRoot => list_root(&manager),
                        SpecialCommand::SetTitle(title) => set_title(&manager, title.as_deref()),
                        SpecialCommand::ShowPrompt => {
                            println!("{}\n", manager.agent().system_prompt().dimmed());
                            Ok(())
                        }
                        SpecialCommand::SwitchModel(next) => {
                            println!("Loading {}...", next);
                            let result = manager.reboot_agent(None, next.clone()).await;
                            if result.is_ok() {
                                println!("{}\n", format!("Now using {}", next).green());
                                model = next;
                            }
                            result
                        }
                        SpecialCommand::ShowStatus => print_status(&manager, &model),
                    };

                    if let Err(e) = result {
                        print_error(&e);
                    }
                }
                Err(ReadlineError::Interrupted) => {
                    println!("CTRL-C");
                    break;
                }
                Err(ReadlineError::Eof) => {
                    println!("CTRL-D");
                    break;
                }
                Err(err) => {
                    tracing::error!("Readline error: {:?}", err);
                    break;
                }
            }
        }

        manager.shutdown().await?;
        println!("Goodbye!");
        Ok(())
    }

    /// Submit one line and stream the reply to stdout
    ///
    /// Ctrl-C while the reply streams interrupts the agent; the text produced
    /// so far is kept.
    async fn submit_turn(manager: &ConversationManager, input: &str) -> Result<()> {
        let Some(orchestrator) = manager.orchestrator() else {
            println!("{}\n", "No active conversation. Use /new or /open.".yellow());
            return Ok(());
        };
        let agent = manager.agent();
        let mut events = manager.subscribe();

        print!("{} ", format!("{}>", agent.id()).blue().bold());
        std::io::stdout().flush()?;

        let submit = orchestrator.submit(input);
        tokio::pin!(submit);
        let mut listening = true;

        let outcome = loop {
            tokio::select! {
                outcome = &mut submit => break outcome,
                _ = tokio::signal::ctrl_c() => {
                    agent.interrupt();
                }
                event = events.recv(), if listening => match event {
                    Ok(ChatEvent::PartialOutput { delta, .. }) => {
                        print!("{}", delta);
                        std::io::stdout().flush()?;
                    }
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => listening = false,
                },
            }
        };

        // Deltas published just before the turn settled
        while let Ok(event) = events.try_recv() {
            if let ChatEvent::PartialOutput { delta, .. } = event {
                print!("{}", delta);
            }
        }
        println!();

        let outcome = outcome?;
        if outcome.interrupted {
            println!("{}", "[interrupted]".yellow());
        }
        if let Some(stats) = format_stats(&outcome.reply) {
            println!("{}", stats.dimmed());
        }
        println!();
        Ok(())
    }

    fn format_stats(message: &Message) -> Option<String> {
        let tokens = message.n_predicted?;
        let mut stats = format!("{} tokens", tokens);
        if let Some(rate) = message.predicted_per_second {
            stats.push_str(&format!(", {:.1} tok/s", rate));
        }
        if let Some(start) = message.response_start_seconds {
            stats.push_str(&format!(", first token after {:.2}s", start));
        }
        if let Some(model) = &message.model_name {
            stats.push_str(&format!(" ({})", model));
        }
        Some(stats)
    }

    fn open_conversation(manager: &ConversationManager, id: &str) -> Result<()> {
        let conversation = manager.store().resolve_conversation(id)?;
        manager.set_current_conversation(conversation.id)?;
        print_transcript(manager)
    }

    fn set_title(manager: &ConversationManager, title: Option<&str>) -> Result<()> {
        let Some(conversation) = manager.current_conversation() else {
            println!("{}\n", "No active conversation.".yellow());
            return Ok(());
        };
        manager.store().set_conversation_title(conversation.id, title)?;
        let title = manager.store().conversation_title(conversation.id)?;
        println!("Title: {}\n", title.bold());
        Ok(())
    }

    fn list_root(manager: &ConversationManager) -> Result<()> {
        let items = manager.fetch_root_items()?;
        for folder in &items.folders {
            println!("  {} {}/", short_id(&folder.id).cyan(), folder.name.bold());
        }
        for conversation in &items.conversations {
            let title = manager.store().conversation_title(conversation.id)?;
            println!("  {} {}", short_id(&conversation.id).cyan(), title);
        }
        if items.folders.is_empty() && items.conversations.is_empty() {
            println!("{}", "Nothing here yet.".yellow());
        }
        println!();
        Ok(())
    }

    fn print_transcript(manager: &ConversationManager) -> Result<()> {
        let Some(orchestrator) = manager.orchestrator() else {
            return Ok(());
        };
        let messages = orchestrator.messages();
        if messages.is_empty() {
            return Ok(());
        }

        let title = manager
            .store()
            .conversation_title(orchestrator.conversation_id())?;
        println!("{}\n", title.bold().underline());
        for message in messages {
            if message.is_from_user() {
                println!("{} {}", "you>".green().bold(), message.text);
            } else {
                println!(
                    "{} {}",
                    format!("{}>", message.from_id).blue().bold(),
                    message.text
                );
            }
        }
        println!();
        Ok(())
    }

    fn print_welcome_banner(model: &ModelRef) {
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║               llamachat - Interactive Chat                   ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");
        println!("Model: {}", model.to_string().cyan());
        println!("Type '/help' for available commands, 'exit' to quit\n");
    }

    fn print_status(manager: &ConversationManager, model: &ModelRef) -> Result<()> {
        let agent = manager.agent();
        println!("\n╔══════════════════════════════════════════════════════════════╗");
        println!("║                    llamachat Session Status                  ║");
        println!("╚══════════════════════════════════════════════════════════════╝\n");
        println!("Agent:         {} ({})", agent.id().bold(), agent.status());
        println!("Model:         {}", model);
        if let Some(loading) = manager.loading_model_id() {
            println!("Loading:       {}", loading.yellow());
        }
        match manager.current_conversation() {
            Some(conversation) => {
                let store = manager.store();
                println!(
                    "Conversation:  {} {}",
                    short_id(&conversation.id).cyan(),
                    store.conversation_title(conversation.id)?
                );
                println!(
                    "Messages:      {}",
                    store.message_count(conversation.id)?
                );
            }
            None => println!("Conversation:  -"),
        }
        println!();
        Ok(())
    }

    fn print_error(error: &anyhow::Error) {
        println!("{}", format!("Error: {}", error).red());
        if let Some(channel_error) = error.downcast_ref::<ChannelError>() {
            println!("{}", channel_error.recovery_suggestion().yellow());
        }
        println!();
    }
}
