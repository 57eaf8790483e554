//! Completion channels for llamachat
//!
//! This module contains the completion channel abstraction and the
//! llama.cpp server implementation.

pub mod base;
pub mod llama;

pub use base::{ChannelOptions, CompletionChannel, CompletionResult, ModelRef, PartialSink};
pub use llama::LlamaServerChannel;

use crate::config::BackendConfig;
use crate::error::Result;
use std::sync::Arc;

/// Create a completion channel for `model`
///
/// Local models are served on the configured local port; remote models use
/// the endpoint they name.
///
/// # Arguments
///
/// * `backend` - Backend configuration (local address, timeouts)
/// * `model` - Model to bind the channel to
///
/// # Errors
///
/// Returns error if the HTTP client cannot be initialized
///
/// # Examples
///
/// ```
/// use llamachat::config::BackendConfig;
/// use llamachat::providers::{create_channel, ModelRef};
///
/// let backend = BackendConfig::default();
/// let channel = create_channel(&backend, &ModelRef::from_backend(&backend));
/// assert!(channel.is_ok());
/// ```
pub fn create_channel(
    backend: &BackendConfig,
    model: &ModelRef,
) -> Result<Arc<dyn CompletionChannel>> {
    Ok(Arc::new(LlamaServerChannel::new(
        &model.server_url(backend),
        model.clone(),
        backend.request_timeout(),
    )?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_create_channel_for_local_model() {
        let backend = BackendConfig::default();
        let model = ModelRef::Local(PathBuf::from("/models/a.gguf"));
        assert!(create_channel(&backend, &model).is_ok());
    }

    #[test]
    fn test_create_channel_for_remote_endpoint() {
        let backend = BackendConfig::default();
        let model = ModelRef::Remote {
            host: "example.org".to_string(),
            port: 443,
            tls: true,
        };
        assert!(create_channel(&backend, &model).is_ok());
    }
}
