use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use serde_json::Value as JsonValue;
use simple_runner_core::ConfigOverrides;
use simple_runner_core::ContextPublisher;
use simple_runner_core::FileConfigSource;
use simple_runner_core::OutputSink;
use simple_runner_core::PtyTerminalHost;
use simple_runner_core::Runner;
use simple_runner_core::ScratchDir;
use simple_runner_core::SystemTreeKiller;
use simple_runner_core::TOOL_NAME;
use tokio::task::JoinHandle;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::EnvFilter;

mod blocks_cmd;
mod run_cmd;

use blocks_cmd::BlocksArgs;
use run_cmd::RunArgs;
use run_cmd::RunBlockArgs;

/// Runs files and fenced code blocks from Markdown documents with a
/// per-language command template.
#[derive(Debug, Parser)]
#[command(name = "simple-runner", version)]
pub struct Cli {
    /// Configuration file. Defaults to `<config dir>/simple-runner/config.toml`.
    #[arg(long, value_name = "PATH", global = true)]
    pub config: Option<PathBuf>,

    /// Workspace folder used as working directory for files inside it. May be
    /// repeated; defaults to the current directory.
    #[arg(long = "workspace", value_name = "DIR", global = true)]
    pub workspaces: Vec<PathBuf>,

    /// Type commands into an interactive shell instead of supervising them.
    #[arg(long, global = true)]
    pub in_terminal: bool,

    /// Directory for snippet files extracted from documents.
    #[arg(long, value_name = "DIR", global = true)]
    pub scratch_dir: Option<PathBuf>,

    /// Also write logs to this file.
    #[arg(long, value_name = "PATH", global = true)]
    pub log_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the fenced code blocks of a document.
    Blocks(BlocksArgs),
    /// Run a file with the template of its language.
    Run(RunArgs),
    /// Run one fenced code block of a document.
    RunBlock(RunBlockArgs),
    /// Print the languages that have a command template.
    Languages,
}

pub fn run_main(cli: Cli) -> Result<ExitCode> {
    let _log_guard = init_tracing(cli.log_file.as_deref())?;
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start the async runtime")?;
    runtime.block_on(dispatch(cli))
}

async fn dispatch(cli: Cli) -> Result<ExitCode> {
    let context = RunnerContext::new(&cli)?;
    match cli.command {
        Command::Blocks(args) => blocks_cmd::run(&context, args),
        Command::Run(args) => run_cmd::run_file(&context, args).await,
        Command::RunBlock(args) => run_cmd::run_block(&context, args).await,
        Command::Languages => {
            for language in context.runner.publish_supported_languages() {
                println!("{language}");
            }
            Ok(ExitCode::SUCCESS)
        }
    }
}

/// Everything a subcommand needs to talk to the core.
pub(crate) struct RunnerContext {
    pub(crate) runner: Runner,
    pub(crate) terminal_host: Arc<PtyTerminalHost>,
    /// Drops the cached terminal session as soon as its shell exits.
    closure_watcher: Option<JoinHandle<()>>,
}

impl RunnerContext {
    /// Must be called from within a Tokio runtime.
    fn new(cli: &Cli) -> Result<Self> {
        let config_path = match &cli.config {
            Some(path) => path.clone(),
            None => default_config_path(),
        };
        let workspaces = if cli.workspaces.is_empty() {
            vec![std::env::current_dir().context("failed to resolve the current directory")?]
        } else {
            cli.workspaces
                .iter()
                .map(|dir| absolute(dir.as_path()))
                .collect::<Result<Vec<_>>>()?
        };
        let config = FileConfigSource::new(config_path).with_overrides(ConfigOverrides {
            run_in_terminal: cli.in_terminal.then_some(true),
            workspace_folders: workspaces,
        });
        tracing::debug!(config = %config.path().display(), "using configuration file");

        let sink: Arc<dyn OutputSink> = Arc::new(StdoutSink);
        let terminal_host = Arc::new(PtyTerminalHost::new(Arc::clone(&sink)));
        let mut runner = Runner::new(
            Arc::new(config),
            sink,
            Arc::new(TracingPublisher),
            Arc::new(SystemTreeKiller),
            terminal_host.clone(),
        );
        if let Some(dir) = &cli.scratch_dir {
            runner = runner.with_scratch_dir(ScratchDir::new(absolute(dir)?));
        }
        let closure_watcher = runner.terminal().watch_host_closures();
        Ok(Self {
            runner,
            terminal_host,
            closure_watcher,
        })
    }
}

impl Drop for RunnerContext {
    fn drop(&mut self) {
        if let Some(watcher) = self.closure_watcher.take() {
            watcher.abort();
        }
    }
}

fn default_config_path() -> PathBuf {
    match dirs::config_dir() {
        Some(dir) => dir.join(TOOL_NAME).join("config.toml"),
        None => PathBuf::from(format!(".{TOOL_NAME}.toml")),
    }
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path).with_context(|| format!("failed to resolve {}", path.display()))
}

/// Writes run output straight to stdout.
struct StdoutSink;

impl OutputSink for StdoutSink {
    fn append(&self, text: &str) {
        let mut stdout = std::io::stdout().lock();
        let _ = stdout.write_all(text.as_bytes());
        let _ = stdout.flush();
    }

    fn show(&self, _preserve_focus: bool) {}

    // The console keeps its scrollback.
    fn clear(&self) {}
}

/// There is no UI to update in a terminal, so context updates become log
/// events.
struct TracingPublisher;

impl ContextPublisher for TracingPublisher {
    fn publish(&self, key: &str, value: JsonValue) {
        tracing::debug!(key, %value, "context updated");
    }
}

fn init_tracing(log_file: Option<&Path>) -> Result<Option<WorkerGuard>> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    let Some(path) = log_file else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(std::io::stderr)
            .try_init();
        return Ok(None);
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("failed to open log file {}", path.display()))?;
    let (writer, guard) = tracing_appender::non_blocking(file);
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(writer)
        .with_ansi(false)
        .try_init();
    Ok(Some(guard))
}
