//! Command-line interface definition for llamachat
//!
//! This module defines the CLI structure using clap's derive API,
//! providing the chat loop and history/folder management commands.

use clap::{Parser, Subcommand};

/// llamachat - chat with a llama.cpp server
///
/// Conversations are kept in a local database and can be organized into
/// folders whose system prompts apply to everything inside them.
#[derive(Parser, Debug, Clone)]
#[command(name = "llamachat")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config/config.yaml")]
    pub config: Option<String>,

    /// Path to the conversation database
    #[arg(long)]
    pub db: Option<String>,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for llamachat
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Start an interactive chat
    Chat {
        /// Resume a conversation (id or id prefix)
        #[arg(long)]
        conversation: Option<String>,

        /// Folder for a new conversation (id or id prefix)
        #[arg(short, long, conflicts_with = "conversation")]
        folder: Option<String>,

        /// Sampling temperature override
        #[arg(short, long)]
        temperature: Option<f64>,
    },

    /// Manage conversation history
    History {
        /// History subcommand
        #[command(subcommand)]
        command: HistoryCommand,
    },

    /// Manage folders
    Folder {
        /// Folder subcommand
        #[command(subcommand)]
        command: FolderCommand,
    },
}

/// History management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum HistoryCommand {
    /// List conversations
    List {
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Show the messages of a conversation
    Show {
        /// Conversation id or id prefix
        id: String,
    },

    /// Delete a conversation and its messages
    Delete {
        /// Conversation id or id prefix
        id: String,
    },

    /// Move a conversation into a folder, or to the root
    Move {
        /// Conversation id or id prefix
        id: String,

        /// Target folder; the root when omitted
        #[arg(short, long)]
        folder: Option<String>,
    },

    /// Set the title of a conversation
    Title {
        /// Conversation id or id prefix
        id: String,

        /// New title; an empty string clears it
        title: String,
    },
}

/// Folder management subcommands
#[derive(Subcommand, Debug, Clone)]
pub enum FolderCommand {
    /// List folders as a tree
    List {
        /// Print JSON instead of a tree
        #[arg(long)]
        json: bool,
    },

    /// Create a folder
    New {
        /// Folder name
        name: Option<String>,

        /// Parent folder; the root when omitted
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Rename a folder
    Rename {
        /// Folder id or id prefix
        id: String,

        /// New name
        name: String,
    },

    /// Move a folder under another one, or to the root
    Move {
        /// Folder id or id prefix
        id: String,

        /// New parent; the root when omitted
        #[arg(short, long)]
        parent: Option<String>,
    },

    /// Show or set the system prompt of a folder
    Prompt {
        /// Folder id or id prefix
        id: String,

        /// New system prompt; an empty string clears it
        text: Option<String>,
    },

    /// Delete a folder; its contents move up to the root
    Delete {
        /// Folder id or id prefix
        id: String,
    },
}

impl Cli {
    /// Parse command line arguments
    ///
    /// # Returns
    ///
    /// Returns the parsed CLI structure
    pub fn parse_args() -> Self {
        Self::parse()
    }
}

impl Default for Cli {
    fn default() -> Self {
        Self {
            config: Some("config/config.yaml".to_string()),
            db: None,
            verbose: false,
            command: Commands::History {
                command: HistoryCommand::List { json: false },
            },
        }
    }
}
