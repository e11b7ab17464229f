//! Entry points a host binds its commands to.
//!
//! [`Runner`] ties the pieces together: it looks up the command template for
//! a language, expands it for the file being run and hands the result either
//! to the [`ExecEngine`] or to the interactive terminal session.

use std::path::Path;
use std::sync::Arc;

use serde_json::json;

use crate::SUPPORTED_LANGUAGES_CONTEXT_KEY;
use crate::config::ConfigSource;
use crate::exec::ExecEngine;
use crate::exec::RunDispatch;
use crate::exec::RunTarget;
use crate::fences::CodeBlock;
use crate::fences::extract_code_blocks;
use crate::language::LanguageId;
use crate::output::ContextPublisher;
use crate::output::OutputSink;
use crate::process_tree::ProcessTreeKiller;
use crate::scratch::ScratchDir;
use crate::template;
use crate::terminal::TerminalHost;
use crate::terminal::TerminalSessionManager;

/// Where a run request ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Process(RunDispatch),
    /// Typed into the interactive session; nothing to wait for.
    Terminal,
    /// No command template for the language; a notice went to the sink.
    NoRunner,
    /// The scratch directory, snippet file or terminal was unusable. The
    /// error was logged and written to the sink.
    Aborted,
}

#[derive(Clone)]
pub struct Runner {
    config: Arc<dyn ConfigSource>,
    engine: ExecEngine,
    terminal: TerminalSessionManager,
    scratch: ScratchDir,
    sink: Arc<dyn OutputSink>,
    publisher: Arc<dyn ContextPublisher>,
}

impl Runner {
    pub fn new(
        config: Arc<dyn ConfigSource>,
        sink: Arc<dyn OutputSink>,
        publisher: Arc<dyn ContextPublisher>,
        killer: Arc<dyn ProcessTreeKiller>,
        terminal_host: Arc<dyn TerminalHost>,
    ) -> Self {
        let engine = ExecEngine::new(
            Arc::clone(&config),
            Arc::clone(&sink),
            Arc::clone(&publisher),
            killer,
        );
        let terminal = TerminalSessionManager::new(terminal_host, Arc::clone(&config));
        Self {
            config,
            engine,
            terminal,
            scratch: ScratchDir::default(),
            sink,
            publisher,
        }
    }

    pub fn with_scratch_dir(mut self, scratch: ScratchDir) -> Self {
        self.scratch = scratch;
        self
    }

    pub fn engine(&self) -> &ExecEngine {
        &self.engine
    }

    pub fn terminal(&self) -> &TerminalSessionManager {
        &self.terminal
    }

    pub fn scratch_dir(&self) -> &ScratchDir {
        &self.scratch
    }

    /// Code blocks of `text`, classified with the configured aliases.
    pub fn code_blocks(&self, text: &str) -> Vec<CodeBlock> {
        let registry = self.config.load().language_registry();
        extract_code_blocks(text, &registry).collect()
    }

    pub fn has_runner(&self, language: &LanguageId) -> bool {
        self.config.load().runner_map.get(language).is_some()
    }

    pub fn runnable(&self, block: &CodeBlock) -> bool {
        self.has_runner(block.language_id())
    }

    pub fn language_for_path(&self, path: &Path) -> Option<LanguageId> {
        self.config.load().language_registry().language_for_path(path)
    }

    /// Publishes the sorted languages that have a usable template.
    pub fn publish_supported_languages(&self) -> Vec<LanguageId> {
        let languages = self.config.load().runner_map.supported_languages();
        let value = json!(languages.iter().map(LanguageId::as_str).collect::<Vec<_>>());
        self.publisher.publish(SUPPORTED_LANGUAGES_CONTEXT_KEY, value);
        languages
    }

    /// Expands the template of `language` for `path` and runs it, either as a
    /// supervised process or typed into the terminal session.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run_file(&self, path: &Path, language: &LanguageId) -> Dispatch {
        let config = self.config.load();
        let Some(template) = config.runner_map.get(language) else {
            tracing::warn!(%language, path = %path.display(), "no runner configured");
            self.sink
                .append(&format!("[warn] No runner configured for language: {language}\n"));
            return Dispatch::NoRunner;
        };

        let scratch_dir = match self.scratch.ensure() {
            Ok(dir) => dir,
            Err(err) => return self.abort(err),
        };
        let command = template::expand(template.as_str(), path, scratch_dir);

        if config.run_in_terminal {
            return match self.terminal.send_to_session(&command) {
                Ok(()) => Dispatch::Terminal,
                Err(err) => self.abort(err),
            };
        }
        Dispatch::Process(self.engine.run(RunTarget::from(path), &command))
    }

    /// Writes `block` to its scratch file and runs that file.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn run_code_block(&self, block: &CodeBlock) -> Dispatch {
        match self.scratch.materialize(block) {
            Ok(path) => self.run_file(&path, block.language_id()),
            Err(err) => self.abort(err),
        }
    }

    /// Cancels the process running `path`. Returns whether one was running.
    pub fn stop_task(&self, path: &Path) -> bool {
        self.engine.cancel(&RunTarget::from(path))
    }

    fn abort(&self, err: impl std::error::Error) -> Dispatch {
        tracing::error!("{err}");
        self.sink.append(&format!("[error] {err}\n"));
        Dispatch::Aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RunnerConfig;
    use crate::config::SharedConfig;
    use crate::output::NoopPublisher;
    use crate::process_tree::SystemTreeKiller;
    use crate::terminal::TerminalError;
    use crate::terminal::TerminalHandle;
    use pretty_assertions::assert_eq;
    use serde_json::Value as JsonValue;
    use std::sync::Mutex;
    use tempfile::tempdir;

    #[derive(Default)]
    struct Recorder {
        text: Mutex<String>,
        published: Mutex<Vec<(String, JsonValue)>>,
        typed: Mutex<Vec<String>>,
    }

    impl OutputSink for Recorder {
        fn append(&self, text: &str) {
            self.text.lock().unwrap().push_str(text);
        }

        fn show(&self, _preserve_focus: bool) {}

        fn clear(&self) {}
    }

    impl ContextPublisher for Recorder {
        fn publish(&self, key: &str, value: JsonValue) {
            self.published.lock().unwrap().push((key.to_string(), value));
        }
    }

    struct RecordingTerminal(Arc<Recorder>);

    impl TerminalHandle for RecordingTerminal {
        fn name(&self) -> &str {
            crate::TOOL_NAME
        }

        fn is_alive(&self) -> bool {
            true
        }

        fn show(&self, _preserve_focus: bool) {}

        fn clear(&self) {}

        fn send_text(&self, text: &str, _add_newline: bool) -> Result<(), TerminalError> {
            self.0.typed.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    impl TerminalHost for Recorder {
        fn find(&self, _name: &str) -> Option<Arc<dyn TerminalHandle>> {
            None
        }

        fn create(&self, name: &str) -> Result<Arc<dyn TerminalHandle>, TerminalError> {
            Err(TerminalError::SessionClosed {
                name: name.to_string(),
            })
        }
    }

    struct TypingHost(Arc<Recorder>);

    impl TerminalHost for TypingHost {
        fn find(&self, _name: &str) -> Option<Arc<dyn TerminalHandle>> {
            None
        }

        fn create(&self, _name: &str) -> Result<Arc<dyn TerminalHandle>, TerminalError> {
            Ok(Arc::new(RecordingTerminal(Arc::clone(&self.0))))
        }
    }

    fn test_runner(config: RunnerConfig, recorder: &Arc<Recorder>, scratch: &Path) -> Runner {
        Runner::new(
            Arc::new(SharedConfig::new(config)),
            recorder.clone(),
            recorder.clone(),
            Arc::new(SystemTreeKiller),
            Arc::new(TypingHost(Arc::clone(recorder))),
        )
        .with_scratch_dir(ScratchDir::new(scratch))
    }

    fn terminal_config() -> RunnerConfig {
        RunnerConfig {
            run_in_terminal: true,
            runner_map: [("python", "python3 {file}"), ("go", "")]
                .into_iter()
                .collect(),
            ..RunnerConfig::default()
        }
    }

    #[test]
    fn missing_template_runs_nothing() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(terminal_config(), &recorder, dir.path());

        let go = LanguageId::new("go");
        assert!(!runner.has_runner(&go));
        assert_eq!(runner.run_file(Path::new("/tmp/main.go"), &go), Dispatch::NoRunner);
        assert!(recorder.typed.lock().unwrap().is_empty());
        assert_eq!(
            *recorder.text.lock().unwrap(),
            "[warn] No runner configured for language: go\n"
        );
    }

    #[test]
    fn terminal_mode_types_the_expanded_command() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(terminal_config(), &recorder, dir.path());

        let dispatch = runner.run_file(Path::new("/tmp/x/report.py"), &LanguageId::new("python"));
        assert_eq!(dispatch, Dispatch::Terminal);
        assert_eq!(
            *recorder.typed.lock().unwrap(),
            vec!["python3 /tmp/x/report.py".to_string()]
        );
        assert!(runner.engine().running_targets().is_empty());
    }

    #[test]
    fn code_blocks_run_from_their_content_addressed_file() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(terminal_config(), &recorder, dir.path());

        let blocks = runner.code_blocks("```py\nprint(1)\n```\n```go\nfunc main() {}\n```\n");
        assert_eq!(blocks.len(), 2);
        assert!(runner.runnable(&blocks[0]));
        assert!(!runner.runnable(&blocks[1]));

        assert_eq!(runner.run_code_block(&blocks[0]), Dispatch::Terminal);
        assert_eq!(runner.run_code_block(&blocks[0]), Dispatch::Terminal);

        let path = runner.scratch_dir().snippet_path(&blocks[0]);
        let expected = format!("python3 {}", path.display());
        assert_eq!(
            *recorder.typed.lock().unwrap(),
            vec![expected.clone(), expected]
        );
        assert_eq!(std::fs::read_to_string(path).unwrap(), "print(1)\n");
    }

    #[test]
    fn terminal_failures_abort_the_run() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = Runner::new(
            Arc::new(SharedConfig::new(terminal_config())),
            recorder.clone(),
            Arc::new(NoopPublisher),
            Arc::new(SystemTreeKiller),
            recorder.clone(),
        )
        .with_scratch_dir(ScratchDir::new(dir.path()));

        let dispatch = runner.run_file(Path::new("/tmp/a.py"), &LanguageId::new("python"));
        assert_eq!(dispatch, Dispatch::Aborted);
        assert!(recorder.text.lock().unwrap().starts_with("[error] "));
    }

    #[test]
    fn unusable_scratch_dir_aborts_block_runs() {
        let dir = tempdir().unwrap();
        let occupied = dir.path().join("file");
        std::fs::write(&occupied, "x").unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(terminal_config(), &recorder, &occupied.join("scratch"));

        let blocks = runner.code_blocks("```py\nprint(1)\n```\n");
        assert_eq!(runner.run_code_block(&blocks[0]), Dispatch::Aborted);
        assert!(recorder.typed.lock().unwrap().is_empty());
    }

    #[test]
    fn supported_languages_are_published_sorted() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let config = RunnerConfig {
            runner_map: [("ruby", "ruby {file}"), ("go", " "), ("bat", "{file}")]
                .into_iter()
                .collect(),
            ..RunnerConfig::default()
        };
        let runner = test_runner(config, &recorder, dir.path());

        let languages = runner.publish_supported_languages();
        assert_eq!(languages, vec![LanguageId::new("bat"), LanguageId::new("ruby")]);
        assert_eq!(
            *recorder.published.lock().unwrap(),
            vec![(
                SUPPORTED_LANGUAGES_CONTEXT_KEY.to_string(),
                json!(["bat", "ruby"])
            )]
        );
    }

    #[test]
    fn stopping_an_idle_path_is_ignored() {
        let dir = tempdir().unwrap();
        let recorder = Arc::new(Recorder::default());
        let runner = test_runner(RunnerConfig::default(), &recorder, dir.path());
        assert!(!runner.stop_task(Path::new("/tmp/not-running.sh")));
    }
}
