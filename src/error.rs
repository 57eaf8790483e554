//! Error types for llamachat
//!
//! This module defines the error types used throughout the application,
//! using `thiserror` for ergonomic error handling.
//!
//! Two families exist: [`LlamachatError`] for store, configuration and agent
//! failures, and [`ChannelError`] for failures reported by the completion
//! channel. The turn orchestrator tells them apart with
//! `anyhow::Error::downcast_ref::<ChannelError>()`.

use thiserror::Error;

/// Main error type for llamachat operations
#[derive(Error, Debug)]
pub enum LlamachatError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Conversation storage errors (database operations)
    #[error("Storage error: {0}")]
    Storage(String),

    /// A folder, conversation or message could not be found
    #[error("Not found: {0}")]
    NotFound(String),

    /// Moving a folder would make it its own ancestor
    #[error("Folder cycle rejected: {0}")]
    FolderCycle(String),

    /// The agent did not become ready after repeated interruption
    #[error("Agent busy: {0}")]
    AgentBusy(String),

    /// IO errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization errors
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

/// Errors reported by a completion channel
///
/// These are surfaced verbatim to the presentation layer together with
/// [`ChannelError::recovery_suggestion`]. The agent never retries them.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// The inference server could not be reached
    #[error("Inference server unreachable: {0}")]
    Unreachable(String),

    /// The server answered with a non-success status
    #[error("Inference server returned HTTP {status}: {body}")]
    Http {
        /// HTTP status code
        status: u16,
        /// Response body, possibly empty
        body: String,
    },

    /// The server's response could not be decoded
    #[error("Malformed response from inference server: {0}")]
    MalformedResponse(String),

    /// The server stopped responding mid-stream
    #[error("Inference server timed out: {0}")]
    Timeout(String),
}

impl ChannelError {
    /// Human readable hint shown next to the error
    pub fn recovery_suggestion(&self) -> &'static str {
        match self {
            Self::Unreachable(_) => {
                "Check that the inference server is running and the host/port settings are correct."
            }
            Self::Http { .. } => "Try again; if the problem persists, restart the server.",
            Self::MalformedResponse(_) => {
                "The server sent an unexpected response. Make sure it is a llama.cpp compatible server."
            }
            Self::Timeout(_) => "The model may still be loading. Wait a moment and try again.",
        }
    }
}

/// Result type alias for llamachat operations
///
/// Uses `anyhow::Error` so callers get rich context while typed errors
/// remain recoverable through downcasting.
pub type Result<T> = anyhow::Result<T>;
