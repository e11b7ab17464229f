use std::io;
use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, RunnerError>;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("failed to create scratch directory {}: {source}", path.display())]
    ScratchDir {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to write snippet to {}: {source}", path.display())]
    WriteSnippet {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to spawn `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: io::Error,
    },

    #[error("failed to read config file {}: {source}", path.display())]
    ReadConfig {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    ParseConfig {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },
}

impl RunnerError {
    pub(crate) fn scratch_dir(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::ScratchDir {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn write_snippet(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::WriteSnippet {
            path: path.into(),
            source,
        }
    }
}
