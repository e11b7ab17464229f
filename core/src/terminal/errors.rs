use thiserror::Error;

#[derive(Debug, Error)]
pub enum TerminalError {
    #[error("failed to create terminal session {name}: {pty_error}")]
    CreateSession {
        name: String,
        #[source]
        pty_error: anyhow::Error,
    },
    #[error("terminal session {name} is closed")]
    SessionClosed { name: String },
    #[error("failed to write to terminal session {name}")]
    WriteToSession { name: String },
}

impl TerminalError {
    pub(crate) fn create_session(name: &str, error: impl Into<anyhow::Error>) -> Self {
        Self::CreateSession {
            name: name.to_string(),
            pty_error: error.into(),
        }
    }
}
