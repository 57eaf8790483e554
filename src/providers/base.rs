//! Completion channel trait and common types
//!
//! A completion channel turns a fully rendered prompt into streamed text.
//! The agent owns the prompt; the channel only transports it.

use crate::config::BackendConfig;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use tokio_util::sync::CancellationToken;

/// Sampling and length options for a single request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelOptions {
    /// Sampling temperature; the server default applies when unset
    pub temperature: Option<f64>,
    /// Context length the agent was configured with
    pub context_length: usize,
    /// Maximum tokens to predict; `Some(0)` only evaluates the prompt
    pub n_predict: Option<i32>,
}

impl ChannelOptions {
    /// Options with the given context length and server defaults otherwise
    pub fn new(context_length: usize) -> Self {
        Self {
            temperature: None,
            context_length,
            n_predict: None,
        }
    }

    /// Sets the sampling temperature
    pub fn with_temperature(mut self, temperature: Option<f64>) -> Self {
        self.temperature = temperature;
        self
    }

    /// Copy of these options that predicts nothing
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::providers::ChannelOptions;
    ///
    /// let warm = ChannelOptions::new(4096).for_warmup();
    /// assert_eq!(warm.n_predict, Some(0));
    /// ```
    pub fn for_warmup(&self) -> Self {
        Self {
            n_predict: Some(0),
            ..self.clone()
        }
    }
}

/// Final outcome of a streamed completion
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompletionResult {
    /// Full text produced by the model
    pub text: String,
    /// Generation speed in tokens per second
    pub predicted_per_second: Option<f64>,
    /// Seconds from request start to the first streamed content
    pub response_start_seconds: Option<f64>,
    /// Number of predicted tokens
    pub n_predicted: Option<i64>,
    /// Model name reported by the server
    pub model_name: Option<String>,
    /// The stream was cancelled before the server finished
    pub interrupted: bool,
}

impl CompletionResult {
    /// Completed result carrying only text
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }

    /// Result of a stream that was cancelled after producing `text`
    pub fn interrupted(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            interrupted: true,
            ..Default::default()
        }
    }
}

/// Model an agent is bound to
///
/// A local model file is served by the server configured under
/// `backend.local`; a remote endpoint already has a model loaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelRef {
    /// Model file served on the local port
    Local(PathBuf),
    /// Remote llama.cpp server
    Remote {
        /// Server host
        host: String,
        /// Server port
        port: u16,
        /// Use https
        tls: bool,
    },
}

impl ModelRef {
    /// Model selected by the backend configuration
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::config::BackendConfig;
    /// use llamachat::providers::ModelRef;
    ///
    /// let model = ModelRef::from_backend(&BackendConfig::default());
    /// assert!(matches!(model, ModelRef::Local(_)));
    /// ```
    pub fn from_backend(backend: &BackendConfig) -> Self {
        match backend.backend_type.as_str() {
            "remote" => Self::Remote {
                host: backend.remote.host.clone(),
                port: backend.remote.port,
                tls: backend.remote.tls,
            },
            _ => Self::Local(backend.local.model_path.clone().unwrap_or_default()),
        }
    }

    /// Root URL of the server answering for this model
    ///
    /// # Examples
    ///
    /// ```
    /// use llamachat::config::BackendConfig;
    /// use llamachat::providers::ModelRef;
    ///
    /// let backend = BackendConfig::default();
    /// let model = ModelRef::from_backend(&backend);
    /// assert_eq!(model.server_url(&backend), "http://127.0.0.1:8690");
    /// ```
    pub fn server_url(&self, backend: &BackendConfig) -> String {
        match self {
            Self::Local(_) => http_url(&backend.local.host, backend.local.port, false),
            Self::Remote { host, port, tls } => http_url(host, *port, *tls),
        }
    }

    /// Stable identifier used while the model is loading
    pub fn id(&self) -> String {
        match self {
            Self::Local(path) => path.display().to_string(),
            Self::Remote { host, port, .. } => format!("{}:{}", host, port),
        }
    }
}

fn http_url(host: &str, port: u16, tls: bool) -> String {
    let scheme = if tls { "https" } else { "http" };
    format!("{}://{}:{}", scheme, host, port)
}

impl fmt::Display for ModelRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local(path) if path.as_os_str().is_empty() => write!(f, "local server"),
            Self::Local(path) => write!(f, "local model {}", path.display()),
            Self::Remote { host, port, tls } => write!(f, "remote {}", http_url(host, *port, *tls)),
        }
    }
}

/// Receiver of streamed text deltas
pub type PartialSink<'a> = dyn for<'s> Fn(&'s str) + Send + Sync + 'a;

/// Streaming text completion over some transport
///
/// Implementations must call `on_partial` once per delta, in order, before
/// returning. When `cancel` fires they stop reading and return the text
/// produced so far with `interrupted` set. Transport failures are reported
/// as [`crate::error::ChannelError`].
///
/// # Examples
///
/// ```
/// use llamachat::providers::{ChannelOptions, CompletionChannel, CompletionResult, PartialSink};
/// use llamachat::error::Result;
/// use async_trait::async_trait;
/// use tokio_util::sync::CancellationToken;
///
/// struct Echo;
///
/// #[async_trait]
/// impl CompletionChannel for Echo {
///     async fn stream(
///         &self,
///         prompt: &str,
///         _options: &ChannelOptions,
///         on_partial: &PartialSink<'_>,
///         _cancel: CancellationToken,
///     ) -> Result<CompletionResult> {
///         on_partial(prompt);
///         Ok(CompletionResult::new(prompt))
///     }
/// }
/// ```
#[async_trait]
pub trait CompletionChannel: Send + Sync {
    /// Stream a completion for `prompt`
    ///
    /// # Errors
    ///
    /// Returns a `ChannelError` when the server is unreachable, answers with
    /// an error status, sends an undecodable payload or stalls.
    async fn stream(
        &self,
        prompt: &str,
        options: &ChannelOptions,
        on_partial: &PartialSink<'_>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult>;

    /// Check that the server is able to serve completions
    async fn health_check(&self) -> Result<()> {
        Ok(())
    }

    /// Release server-side resources held by this channel
    async fn shutdown(&self) -> Result<()> {
        Ok(())
    }
}
