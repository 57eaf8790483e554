//! Special commands parser for interactive chat
//!
//! Special commands manage the session instead of being sent to the agent:
//! starting or switching conversations, setting titles, swapping the model,
//! and showing status or help.
//!
//! Commands are prefixed with `/`; the command word is case-insensitive.

use crate::providers::ModelRef;
use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur when parsing special commands
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CommandError {
    /// Unknown command was entered
    #[error("Unknown command: {0}\n\nType '/help' to see available commands")]
    UnknownCommand(String),

    /// Command was given an unsupported argument
    #[error("Unsupported argument for {command}: {arg}\n\nType '/help' to see valid usage")]
    UnsupportedArgument { command: String, arg: String },

    /// Command requires an argument but none was provided
    #[error("Command {command} requires an argument\n\nUsage: {usage}")]
    MissingArgument { command: String, usage: String },
}

/// Special commands that can be executed during interactive chat
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecialCommand {
    /// Start a new conversation, discarding empty ones
    NewConversation,

    /// Switch to another conversation by id or id prefix
    Open(String),

    /// List root folders and conversations
    ListRoot,

    /// Set the title of the current conversation; `None` clears it
    SetTitle(Option<String>),

    /// Show the system prompt in effect
    ShowPrompt,

    /// Replace the agent with one bound to another model
    SwitchModel(ModelRef),

    /// Show agent and conversation status
    ShowStatus,

    /// Display help information
    Help,

    /// Exit the interactive session
    Exit,

    /// Not a special command
    ///
    /// The input should be submitted as a user message.
    None,
}

fn missing(command: &str, usage: &str) -> CommandError {
    CommandError::MissingArgument {
        command: command.to_string(),
        usage: usage.to_string(),
    }
}

/// Parse a special command from user input
///
/// # Arguments
///
/// * `input` - The line entered by the user
///
/// # Returns
///
/// Returns the parsed command, or `SpecialCommand::None` for ordinary input
///
/// # Errors
///
/// Returns `CommandError` for unknown commands and missing or invalid
/// arguments
///
/// # Examples
///
/// ```
/// use llamachat::commands::special_commands::{parse_special_command, SpecialCommand};
///
/// assert_eq!(parse_special_command("/new").unwrap(), SpecialCommand::NewConversation);
/// assert_eq!(parse_special_command("hello").unwrap(), SpecialCommand::None);
/// ```
pub fn parse_special_command(input: &str) -> Result<SpecialCommand, CommandError> {
    let trimmed = input.trim();
    let lower = trimmed.to_lowercase();

    if !trimmed.starts_with('/') && lower != "exit" && lower != "quit" {
        return Ok(SpecialCommand::None);
    }

    let (command, arg) = match trimmed.split_once(char::is_whitespace) {
        Some((command, arg)) => (command.to_lowercase(), arg.trim()),
        None => (lower.clone(), ""),
    };

    match command.as_str() {
        "exit" | "quit" | "/exit" | "/quit" => Ok(SpecialCommand::Exit),
        "/help" | "/?" => Ok(SpecialCommand::Help),
        "/status" => Ok(SpecialCommand::ShowStatus),
        "/new" => Ok(SpecialCommand::NewConversation),
        "/list" | "/history" => Ok(SpecialCommand::ListRoot),
        "/prompt" => Ok(SpecialCommand::ShowPrompt),

        "/open" if arg.is_empty() => Err(missing("/open", "/open <conversation_id>")),
        "/open" => Ok(SpecialCommand::Open(arg.to_string())),

        "/title" if arg.is_empty() => Ok(SpecialCommand::SetTitle(None)),
        "/title" => Ok(SpecialCommand::SetTitle(Some(arg.to_string()))),

        "/model" if arg.is_empty() => Err(missing("/model", "/model <model.gguf | host:port>")),
        "/model" => parse_model_ref(arg)
            .map(SpecialCommand::SwitchModel)
            .ok_or_else(|| CommandError::UnsupportedArgument {
                command: "/model".to_string(),
                arg: arg.to_string(),
            }),

        _ => Err(CommandError::UnknownCommand(trimmed.to_string())),
    }
}

/// Interpret a model argument as a remote endpoint or a local model file
///
/// `http://host:port`, `https://host:port` and bare `host:port` name a
/// remote server; anything else is a path.
pub fn parse_model_ref(arg: &str) -> Option<ModelRef> {
    let (rest, tls, explicit) = if let Some(rest) = arg.strip_prefix("https://") {
        (rest, true, true)
    } else if let Some(rest) = arg.strip_prefix("http://") {
        (rest, false, true)
    } else {
        (arg, false, false)
    };

    let rest = rest.trim_end_matches('/');
    if let Some((host, port)) = rest.rsplit_once(':') {
        if !host.is_empty() && !host.contains('/') {
            if let Ok(port) = port.parse::<u16>() {
                return Some(ModelRef::Remote {
                    host: host.to_string(),
                    port,
                    tls,
                });
            }
        }
    }

    if explicit {
        // A scheme without a port is not a usable endpoint
        return None;
    }
    Some(ModelRef::Local(PathBuf::from(arg)))
}

/// Print help for special commands
pub fn print_help() {
    println!(
        r#"
Special Commands for Interactive Chat
=====================================

CONVERSATIONS:
  /new               - Start a new conversation
  /open <id>         - Switch to a conversation (id or id prefix)
  /list              - List root folders and conversations
  /title [text]      - Set the title; clears it without text

AGENT:
  /prompt            - Show the system prompt in effect
  /model <path>      - Load a local model file
  /model host:port   - Use a remote llama.cpp server
  /status            - Show agent and conversation status

SESSION:
  /help              - Show this help
  exit, /quit        - Leave the chat

Press Ctrl-C while a reply is streaming to interrupt it.
"#
    );
}
