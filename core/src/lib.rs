//! Core of `simple-runner`: fenced code block extraction, language
//! classification, command templating and process execution.
//!
//! Hosts provide the collaborators in [`output`], [`config`],
//! [`process_tree`] and [`terminal`]; everything else is owned by the
//! instances constructed here.

pub mod config;
mod error;
pub mod exec;
pub mod fences;
pub mod language;
pub mod output;
pub mod process_tree;
pub mod runner;
pub mod scratch;
pub mod template;
pub mod terminal;

pub use config::CommandTemplate;
pub use config::ConfigOverrides;
pub use config::ConfigSource;
pub use config::FileConfigSource;
pub use config::RunnerConfig;
pub use config::RunnerMap;
pub use config::SharedConfig;
pub use error::Result;
pub use error::RunnerError;
pub use exec::EngineEvent;
pub use exec::ExecEngine;
pub use exec::RunDispatch;
pub use exec::RunTarget;
pub use exec::TaskOutcome;
pub use fences::CodeBlock;
pub use fences::CodeBlocks;
pub use fences::extract_code_blocks;
pub use language::LanguageId;
pub use language::LanguageRegistry;
pub use language::LanguageSpec;
pub use language::TextEncoding;
pub use output::ContextPublisher;
pub use output::NoopPublisher;
pub use output::OutputSink;
pub use process_tree::KillSignal;
pub use process_tree::ProcessTreeKiller;
pub use process_tree::SystemTreeKiller;
pub use runner::Dispatch;
pub use runner::Runner;
pub use scratch::ScratchDir;
pub use terminal::PtyTerminalHost;
pub use terminal::TerminalError;
pub use terminal::TerminalHandle;
pub use terminal::TerminalHost;
pub use terminal::TerminalSessionManager;

/// Name used for the scratch directory, the interactive session and the
/// prefix of every published context key.
pub const TOOL_NAME: &str = "simple-runner";

/// Context key carrying the targets with a live child process.
pub const TASKS_CONTEXT_KEY: &str = "simple-runner.tasks";

/// Context key carrying the languages that have a command template.
pub const SUPPORTED_LANGUAGES_CONTEXT_KEY: &str = "simple-runner.supportedLanguages";
