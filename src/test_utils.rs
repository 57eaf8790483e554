//! Test utilities for llamachat
//!
//! This module provides a scripted completion channel, temporary stores
//! and configuration helpers shared by unit tests.

use crate::config::Config;
use crate::error::{ChannelError, Result};
use crate::providers::{ChannelOptions, CompletionChannel, CompletionResult, PartialSink};
use crate::storage::SqliteStorage;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// One scripted response of a [`ScriptedChannel`]
#[derive(Debug, Clone)]
pub enum Script {
    /// Stream these deltas, then finish
    Reply(Vec<String>),
    /// Stream these deltas, then wait until cancelled
    Hang(Vec<String>),
    /// Stream these deltas, then fail
    Fail(Vec<String>, ChannelError),
    /// Never finish, ignoring cancellation
    Stuck,
}

impl Script {
    /// Reply made of the given deltas
    pub fn reply(deltas: &[&str]) -> Self {
        Self::Reply(deltas.iter().map(|d| d.to_string()).collect())
    }

    /// Stream that never finishes on its own
    pub fn hang(deltas: &[&str]) -> Self {
        Self::Hang(deltas.iter().map(|d| d.to_string()).collect())
    }

    /// Stream that fails after the given deltas
    pub fn fail(deltas: &[&str], error: ChannelError) -> Self {
        Self::Fail(deltas.iter().map(|d| d.to_string()).collect(), error)
    }
}

/// Completion channel that plays back queued [`Script`]s
///
/// Each call to `stream` consumes the next script; an empty queue replies
/// with `"ok"`. Prompts and options of every call are recorded.
#[derive(Debug, Default)]
pub struct ScriptedChannel {
    scripts: Mutex<VecDeque<Script>>,
    calls: Mutex<Vec<(String, ChannelOptions)>>,
    step_delay: Duration,
    shutdowns: AtomicUsize,
}

impl ScriptedChannel {
    /// Channel playing `scripts` in order
    pub fn new(scripts: Vec<Script>) -> Self {
        Self {
            scripts: Mutex::new(scripts.into()),
            ..Default::default()
        }
    }

    /// Sleep this long before each delta
    pub fn with_step_delay(mut self, delay: Duration) -> Self {
        self.step_delay = delay;
        self
    }

    /// Prompts received so far
    pub fn prompts(&self) -> Vec<String> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(p, _)| p.clone())
            .collect()
    }

    /// Options received so far
    pub fn options(&self) -> Vec<ChannelOptions> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .map(|(_, o)| o.clone())
            .collect()
    }

    /// Number of `stream` calls
    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Number of `shutdown` calls
    pub fn shutdown_count(&self) -> usize {
        self.shutdowns.load(Ordering::SeqCst)
    }

    async fn emit(
        &self,
        deltas: &[String],
        on_partial: &PartialSink<'_>,
        cancel: &CancellationToken,
        text: &mut String,
    ) -> bool {
        for delta in deltas {
            if !self.step_delay.is_zero() {
                tokio::select! {
                    _ = cancel.cancelled() => return false,
                    _ = tokio::time::sleep(self.step_delay) => {}
                }
            } else if cancel.is_cancelled() {
                return false;
            }
            text.push_str(delta);
            on_partial(delta);
        }
        true
    }
}

#[async_trait]
impl CompletionChannel for ScriptedChannel {
    async fn stream(
        &self,
        prompt: &str,
        options: &ChannelOptions,
        on_partial: &PartialSink<'_>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        self.calls
            .lock()
            .unwrap()
            .push((prompt.to_string(), options.clone()));
        let script = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Script::reply(&["ok"]));

        let mut text = String::new();
        match script {
            Script::Reply(deltas) => {
                if !self.emit(&deltas, on_partial, &cancel, &mut text).await {
                    return Ok(CompletionResult::interrupted(text));
                }
                Ok(CompletionResult {
                    n_predicted: Some(deltas.len() as i64),
                    predicted_per_second: Some(10.0),
                    response_start_seconds: Some(0.1),
                    model_name: Some("scripted".to_string()),
                    ..CompletionResult::new(text)
                })
            }
            Script::Hang(deltas) => {
                self.emit(&deltas, on_partial, &cancel, &mut text).await;
                cancel.cancelled().await;
                Ok(CompletionResult::interrupted(text))
            }
            Script::Fail(deltas, error) => {
                self.emit(&deltas, on_partial, &cancel, &mut text).await;
                Err(error.into())
            }
            Script::Stuck => std::future::pending().await,
        }
    }

    async fn shutdown(&self) -> Result<()> {
        self.shutdowns.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Create a temporary directory for testing
pub fn temp_dir() -> TempDir {
    TempDir::new().expect("Failed to create temporary directory")
}

/// Store backed by a database in a fresh temporary directory
///
/// The directory is returned so it outlives the store.
pub fn temp_storage() -> (SqliteStorage, TempDir) {
    let dir = temp_dir();
    let storage =
        SqliteStorage::new_with_path(dir.path().join("chat.db")).expect("failed to create storage");
    (storage, dir)
}

/// Configuration with short timings for timer-driven tests
pub fn test_config() -> Config {
    let mut config = Config::default();
    config.agent.system_prompt = "You are a test assistant.".to_string();
    config.orchestrator.max_interrupt_retries = 5;
    config
}
