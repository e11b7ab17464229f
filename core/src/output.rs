//! Host surfaces the core writes to.

use serde_json::Value as JsonValue;

/// Append-only log the host displays, e.g. an output pane or a console.
pub trait OutputSink: Send + Sync {
    /// Appends `text` verbatim; no line splitting is implied.
    fn append(&self, text: &str);

    fn show(&self, preserve_focus: bool);

    fn clear(&self);
}

/// Broadcasts state to host UI, e.g. to enable a "stop" button while a
/// target is running.
pub trait ContextPublisher: Send + Sync {
    fn publish(&self, key: &str, value: JsonValue);
}

/// Publisher for hosts that do not consume context updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPublisher;

impl ContextPublisher for NoopPublisher {
    fn publish(&self, key: &str, value: JsonValue) {
        tracing::trace!(key, %value, "context update dropped");
    }
}
