//! llamachat - chat client library for llama.cpp inference servers
//!
//! This library provides foldered conversation storage, the agent that
//! streams replies from an inference server, and the turn orchestrator that
//! keeps the transcript consistent while replies stream, fail, or are
//! interrupted.
//!
//! # Architecture
//!
//! The library is organized into the following modules:
//!
//! - `storage`: SQLite persistence for folders, conversations and messages
//! - `providers`: Completion channel abstraction and the llama.cpp server channel
//! - `agent`: Running prompt, partial output and status of one agent
//! - `orchestrator`: The per-conversation turn pipeline
//! - `manager`: Active conversation, folder moves and agent reboots
//! - `events`: Broadcast events for front-ends
//! - `config`: Configuration management and validation
//! - `error`: Error types and result aliases
//! - `cli`: Command-line interface definition
//!
//! # Example
//!
//! ```no_run
//! use llamachat::{Config, ConversationManager};
//! use llamachat::storage::SqliteStorage;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("config.yaml", &Default::default())?;
//!     config.validate()?;
//!
//!     let store = Arc::new(SqliteStorage::from_config(&config.storage)?);
//!     let manager = ConversationManager::with_llama_server(store, config)?;
//!     manager.new_conversation(None)?;
//!
//!     if let Some(orchestrator) = manager.orchestrator() {
//!         let outcome = orchestrator.submit("Hello!").await?;
//!         println!("{}", outcome.reply.text);
//!     }
//!     Ok(())
//! }
//! ```

pub mod agent;
pub mod cli;
pub mod commands;
pub mod config;
pub mod error;
pub mod events;
pub mod manager;
pub mod orchestrator;
pub mod providers;
pub mod storage;

// Re-export commonly used types
pub use agent::{Agent, AgentStatus};
pub use config::Config;
pub use error::{ChannelError, LlamachatError, Result};
pub use events::{ChatEvent, EventBus};
pub use manager::ConversationManager;
pub use orchestrator::{TurnOrchestrator, TurnOutcome};

#[cfg(test)]
pub mod test_utils;
