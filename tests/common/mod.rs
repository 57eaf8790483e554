use async_trait::async_trait;
use llamachat::error::{ChannelError, Result};
use llamachat::providers::{ChannelOptions, CompletionChannel, CompletionResult, PartialSink};
use llamachat::storage::SqliteStorage;
use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

#[allow(dead_code)]
pub fn create_temp_storage() -> (SqliteStorage, TempDir) {
    let tmp = TempDir::new().expect("failed to create tempdir");
    let db_path = tmp.path().join("chat.db");
    let storage =
        SqliteStorage::new_with_path(db_path).expect("failed to create sqlite storage with path");
    (storage, tmp)
}

#[allow(dead_code)]
pub fn temp_config_file(contents: &str) -> (TempDir, PathBuf) {
    let temp_dir = TempDir::new().expect("failed to create tempdir");
    let config_path = temp_dir.path().join("config.yaml");
    fs::write(&config_path, contents).expect("failed to write config file");
    (temp_dir, config_path)
}

/// What a [`FakeChannel`] does for one `stream` call
#[allow(dead_code)]
#[derive(Debug, Clone)]
pub enum Step {
    /// Stream the deltas and finish
    Reply(Vec<&'static str>),
    /// Stream the deltas and wait for cancellation
    Hang(Vec<&'static str>),
    /// Stream the deltas and fail
    Fail(Vec<&'static str>, ChannelError),
    /// Wait, then stream the deltas and finish
    Slow(Duration, Vec<&'static str>),
}

/// Completion channel replaying queued steps, recording every prompt
#[allow(dead_code)]
#[derive(Debug, Default)]
pub struct FakeChannel {
    steps: Mutex<VecDeque<Step>>,
    prompts: Mutex<Vec<String>>,
}

#[allow(dead_code)]
impl FakeChannel {
    pub fn new(steps: Vec<Step>) -> Self {
        Self {
            steps: Mutex::new(steps.into()),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn prompts(&self) -> Vec<String> {
        self.prompts.lock().unwrap().clone()
    }
}

#[async_trait]
impl CompletionChannel for FakeChannel {
    async fn stream(
        &self,
        prompt: &str,
        _options: &ChannelOptions,
        on_partial: &PartialSink<'_>,
        cancel: CancellationToken,
    ) -> Result<CompletionResult> {
        self.prompts.lock().unwrap().push(prompt.to_string());
        let step = self
            .steps
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Step::Reply(vec!["ok"]));

        let mut text = String::new();
        let mut emit = |deltas: &[&str]| {
            for delta in deltas {
                text.push_str(delta);
                on_partial(delta);
            }
        };

        match step {
            Step::Reply(deltas) => {
                emit(&deltas);
                Ok(CompletionResult {
                    n_predicted: Some(deltas.len() as i64),
                    model_name: Some("fake".to_string()),
                    ..CompletionResult::new(text)
                })
            }
            Step::Hang(deltas) => {
                emit(&deltas);
                cancel.cancelled().await;
                Ok(CompletionResult::interrupted(text))
            }
            Step::Fail(deltas, error) => {
                emit(&deltas);
                Err(error.into())
            }
            Step::Slow(delay, deltas) => {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(CompletionResult::interrupted(String::new())),
                    _ = tokio::time::sleep(delay) => {}
                }
                emit(&deltas);
                Ok(CompletionResult::new(text))
            }
        }
    }
}
