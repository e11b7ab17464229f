//! Helpers shared by the integration tests of `simple-runner-core`.

use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use serde_json::Value as JsonValue;
use simple_runner_core::ConfigSource;
use simple_runner_core::ContextPublisher;
use simple_runner_core::EngineEvent;
use simple_runner_core::ExecEngine;
use simple_runner_core::OutputSink;
use simple_runner_core::RunTarget;
use simple_runner_core::RunnerConfig;
use simple_runner_core::SharedConfig;
use simple_runner_core::SystemTreeKiller;
use simple_runner_core::TaskOutcome;
use tokio::sync::broadcast;

/// Upper bound for anything a test waits on.
pub const WAIT_TIMEOUT: Duration = Duration::from_secs(20);

/// Sink that remembers everything appended to it.
#[derive(Debug, Default)]
pub struct RecordingSink {
    text: Mutex<String>,
    shows: Mutex<Vec<bool>>,
    clears: Mutex<usize>,
}

impl RecordingSink {
    pub fn text(&self) -> String {
        self.text.lock().unwrap().clone()
    }

    pub fn shows(&self) -> Vec<bool> {
        self.shows.lock().unwrap().clone()
    }

    pub fn clears(&self) -> usize {
        *self.clears.lock().unwrap()
    }
}

impl OutputSink for RecordingSink {
    fn append(&self, text: &str) {
        self.text.lock().unwrap().push_str(text);
    }

    fn show(&self, preserve_focus: bool) {
        self.shows.lock().unwrap().push(preserve_focus);
    }

    fn clear(&self) {
        *self.clears.lock().unwrap() += 1;
        self.text.lock().unwrap().clear();
    }
}

/// Publisher that keeps every `(key, value)` pair in order.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    published: Mutex<Vec<(String, JsonValue)>>,
}

impl RecordingPublisher {
    pub fn published(&self) -> Vec<(String, JsonValue)> {
        self.published.lock().unwrap().clone()
    }

    pub fn last(&self, key: &str) -> Option<JsonValue> {
        self.published
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.clone())
    }
}

impl ContextPublisher for RecordingPublisher {
    fn publish(&self, key: &str, value: JsonValue) {
        self.published
            .lock()
            .unwrap()
            .push((key.to_string(), value));
    }
}

/// An engine wired to recording collaborators.
pub struct TestEngine {
    pub engine: ExecEngine,
    pub sink: Arc<RecordingSink>,
    pub publisher: Arc<RecordingPublisher>,
    pub config: SharedConfig,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(quiet_config())
    }

    pub fn with_config(config: RunnerConfig) -> Self {
        let sink = Arc::new(RecordingSink::default());
        let publisher = Arc::new(RecordingPublisher::default());
        let config = SharedConfig::new(config);
        let engine = ExecEngine::new(
            Arc::new(config.clone()) as Arc<dyn ConfigSource>,
            sink.clone(),
            publisher.clone(),
            Arc::new(SystemTreeKiller),
        );
        Self {
            engine,
            sink,
            publisher,
            config,
        }
    }
}

impl Default for TestEngine {
    fn default() -> Self {
        Self::new()
    }
}

/// Defaults without timestamps, so status lines compare exactly.
pub fn quiet_config() -> RunnerConfig {
    RunnerConfig {
        show_debug_timestamps: false,
        ..RunnerConfig::default()
    }
}

pub fn target(path: impl AsRef<Path>) -> RunTarget {
    RunTarget::new(path.as_ref())
}

/// Waits for the `Finished` event of `target`, skipping everything else.
pub async fn wait_for_finished(
    events: &mut broadcast::Receiver<EngineEvent>,
    target: &RunTarget,
) -> TaskOutcome {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Finished {
                    target: finished,
                    outcome,
                    ..
                }) if &finished == target => return outcome,
                Ok(_) => continue,
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("engine event stream closed before {target} finished")
                }
            }
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for {target} to finish"))
}

/// Waits until `target` has emitted at least one output chunk.
pub async fn wait_for_output(events: &mut broadcast::Receiver<EngineEvent>, target: &RunTarget) {
    let wait = async {
        loop {
            match events.recv().await {
                Ok(EngineEvent::Output { target: from, .. }) if &from == target => return,
                Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => {
                    panic!("engine event stream closed before {target} printed")
                }
            }
        }
    };
    tokio::time::timeout(WAIT_TIMEOUT, wait)
        .await
        .unwrap_or_else(|_| panic!("timed out waiting for output from {target}"));
}
