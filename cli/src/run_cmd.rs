use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use simple_runner_core::Dispatch;
use simple_runner_core::EngineEvent;
use simple_runner_core::LanguageId;
use simple_runner_core::RunDispatch;
use simple_runner_core::RunTarget;
use simple_runner_core::TOOL_NAME;
use simple_runner_core::TaskOutcome;
use simple_runner_core::TerminalHost;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use crate::RunnerContext;
use crate::absolute;
use crate::blocks_cmd::pick;
use crate::blocks_cmd::read_blocks;

/// Exit status when no command template exists for the language.
const NO_RUNNER_EXIT_CODE: u8 = 2;
/// Conventional shell status for a job stopped by SIGINT.
const INTERRUPTED_EXIT_CODE: u8 = 130;

#[derive(Debug, Args)]
pub struct RunArgs {
    #[arg(value_name = "FILE")]
    pub file: PathBuf,

    /// Language of the file. Guessed from the extension when omitted.
    #[arg(long, value_name = "ID")]
    pub language: Option<String>,
}

#[derive(Debug, Args)]
pub struct RunBlockArgs {
    /// Markdown document holding the block.
    #[arg(value_name = "FILE")]
    pub document: PathBuf,

    /// Number of the block to run, as listed by `blocks`.
    #[arg(long, short = 'n', value_name = "N", default_value_t = 1)]
    pub number: usize,
}

pub(crate) async fn run_file(context: &RunnerContext, args: RunArgs) -> Result<ExitCode> {
    let path = absolute(&args.file)?;
    let language = match args.language {
        Some(language) => LanguageId::new(language),
        None => context.runner.language_for_path(&path).with_context(|| {
            format!(
                "cannot tell the language of {}; pass --language",
                path.display()
            )
        })?,
    };

    let pending = Pending::subscribe(context, RunTarget::from(path.as_path()));
    let dispatch = context.runner.run_file(&path, &language);
    pending.finish(context, dispatch).await
}

pub(crate) async fn run_block(context: &RunnerContext, args: RunBlockArgs) -> Result<ExitCode> {
    let blocks = read_blocks(context, &args.document)?;
    let block = pick(&blocks, args.number, &args.document)?;
    let target = RunTarget::from(context.runner.scratch_dir().snippet_path(block));

    let pending = Pending::subscribe(context, target);
    let dispatch = context.runner.run_code_block(block);
    pending.finish(context, dispatch).await
}

/// Subscriptions taken before dispatching, so no completion is missed.
struct Pending {
    target: RunTarget,
    events: broadcast::Receiver<EngineEvent>,
    closed_sessions: Option<broadcast::Receiver<String>>,
}

impl Pending {
    fn subscribe(context: &RunnerContext, target: RunTarget) -> Self {
        Self {
            target,
            events: context.runner.engine().subscribe(),
            closed_sessions: context.terminal_host.closed_sessions(),
        }
    }

    async fn finish(self, context: &RunnerContext, dispatch: Dispatch) -> Result<ExitCode> {
        match dispatch {
            Dispatch::Process(RunDispatch::Spawned { .. }) => {
                wait_for_process(context, &self.target, self.events).await
            }
            Dispatch::Process(RunDispatch::AlreadyRunning) => {
                anyhow::bail!("{} is already running", self.target)
            }
            Dispatch::Process(RunDispatch::Failed) | Dispatch::Aborted => Ok(ExitCode::FAILURE),
            Dispatch::NoRunner => Ok(ExitCode::from(NO_RUNNER_EXIT_CODE)),
            Dispatch::Terminal => wait_for_terminal(context, self.closed_sessions).await,
        }
    }
}

async fn wait_for_process(
    context: &RunnerContext,
    target: &RunTarget,
    mut events: broadcast::Receiver<EngineEvent>,
) -> Result<ExitCode> {
    let mut interrupted = false;
    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(EngineEvent::Finished { target: finished, outcome, .. }) if &finished == target => {
                    return Ok(exit_code(outcome));
                }
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => anyhow::bail!("engine stopped before {target} finished"),
            },
            signal = tokio::signal::ctrl_c(), if !interrupted => {
                signal.context("failed to listen for Ctrl-C")?;
                interrupted = true;
                tracing::info!(%target, "interrupted; stopping the run");
                context.runner.stop_task(target.path());
            }
        }
    }
}

/// The shell keeps running after the command, so ask it to leave and wait
/// until it has.
async fn wait_for_terminal(
    context: &RunnerContext,
    closed_sessions: Option<broadcast::Receiver<String>>,
) -> Result<ExitCode> {
    let Some(mut closed_sessions) = closed_sessions else {
        return Ok(ExitCode::SUCCESS);
    };
    context
        .runner
        .terminal()
        .send_to_session("exit")
        .context("failed to close the terminal session")?;

    loop {
        tokio::select! {
            closed = closed_sessions.recv() => match closed {
                Ok(name) if name == TOOL_NAME => return Ok(ExitCode::SUCCESS),
                Ok(_) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => return Ok(ExitCode::SUCCESS),
            },
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                return Ok(ExitCode::from(INTERRUPTED_EXIT_CODE));
            }
        }
    }
}

fn exit_code(outcome: TaskOutcome) -> ExitCode {
    let code = match outcome {
        TaskOutcome::ExitedWithCode(code) => code,
        TaskOutcome::KilledBySignal(signal) => 128 + signal,
        TaskOutcome::KilledByUnknownMeans => return ExitCode::FAILURE,
    };
    u8::try_from(code).map_or(ExitCode::FAILURE, ExitCode::from)
}
