#![cfg(unix)]

use std::sync::Arc;

use core_test_support::RecordingPublisher;
use core_test_support::RecordingSink;
use core_test_support::quiet_config;
use core_test_support::target;
use core_test_support::wait_for_finished;
use core_test_support::wait_for_output;
use pretty_assertions::assert_eq;
use simple_runner_core::Dispatch;
use simple_runner_core::PtyTerminalHost;
use simple_runner_core::RunDispatch;
use simple_runner_core::Runner;
use simple_runner_core::RunnerConfig;
use simple_runner_core::ScratchDir;
use simple_runner_core::SharedConfig;
use simple_runner_core::SystemTreeKiller;
use simple_runner_core::TaskOutcome;
use tempfile::TempDir;
use tempfile::tempdir;

const DOCUMENT: &str = "# Notes

```sh
echo from-block
```

Some prose.

```bash
echo from-block
```
";

fn build_runner(config: RunnerConfig) -> (Runner, Arc<RecordingSink>, TempDir) {
    let scratch = tempdir().expect("tempdir");
    let sink = Arc::new(RecordingSink::default());
    let runner = Runner::new(
        Arc::new(SharedConfig::new(config)),
        sink.clone(),
        Arc::new(RecordingPublisher::default()),
        Arc::new(SystemTreeKiller),
        Arc::new(PtyTerminalHost::new(sink.clone())),
    )
    .with_scratch_dir(ScratchDir::new(scratch.path().join("simple-runner")));
    (runner, sink, scratch)
}

fn shell_config(template: &str) -> RunnerConfig {
    let mut config = quiet_config();
    config.runner_map.insert("shellscript", template);
    config
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn block_runs_from_its_scratch_file() {
    let (runner, sink, _scratch) = build_runner(shell_config("sh {file}"));
    let mut events = runner.engine().subscribe();

    let blocks = runner.code_blocks(DOCUMENT);
    assert_eq!(blocks.len(), 2);
    let dispatch = runner.run_code_block(&blocks[0]);
    assert!(matches!(
        dispatch,
        Dispatch::Process(RunDispatch::Spawned { .. })
    ));

    let path = runner.scratch_dir().snippet_path(&blocks[0]);
    let outcome = wait_for_finished(&mut events, &target(&path)).await;
    assert_eq!(outcome, TaskOutcome::ExitedWithCode(0));
    assert_eq!(
        std::fs::read_to_string(&path).expect("snippet"),
        "echo from-block\n"
    );
    assert!(sink.text().contains("from-block\n"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn identical_blocks_share_one_target() {
    let (runner, _sink, _scratch) = build_runner(shell_config("sleep 30; sh {file}"));
    let mut events = runner.engine().subscribe();

    let blocks = runner.code_blocks(DOCUMENT);
    let first = runner.scratch_dir().snippet_path(&blocks[0]);
    let second = runner.scratch_dir().snippet_path(&blocks[1]);
    assert_eq!(first, second, "same content, same file");

    assert!(matches!(
        runner.run_code_block(&blocks[0]),
        Dispatch::Process(RunDispatch::Spawned { .. })
    ));
    assert_eq!(
        runner.run_code_block(&blocks[1]),
        Dispatch::Process(RunDispatch::AlreadyRunning)
    );

    assert!(runner.stop_task(&first));
    let outcome = wait_for_finished(&mut events, &target(&first)).await;
    assert!(matches!(outcome, TaskOutcome::KilledBySignal(_)));
    assert!(!runner.stop_task(&first));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn placeholders_resolve_against_the_snippet_path() {
    let (runner, sink, _scratch) =
        build_runner(shell_config("echo {fileBasenameNoExtension} {fileExtname}"));
    let mut events = runner.engine().subscribe();

    let blocks = runner.code_blocks("```zsh\nexit 0\n```\n");
    let path = runner.scratch_dir().snippet_path(&blocks[0]);
    let stem = path
        .file_stem()
        .and_then(|stem| stem.to_str())
        .expect("stem")
        .to_string();

    runner.run_code_block(&blocks[0]);
    wait_for_output(&mut events, &target(&path)).await;
    wait_for_finished(&mut events, &target(&path)).await;

    assert_eq!(stem.len(), 8);
    assert!(sink.text().contains(&format!("{stem} zsh\n")));
}

#[tokio::test]
async fn blocks_without_a_runner_do_not_run() {
    let mut config = quiet_config();
    config.runner_map = [("python", "python3 {file}")].into_iter().collect();
    let (runner, sink, _scratch) = build_runner(config);

    let blocks = runner.code_blocks(DOCUMENT);
    assert!(!runner.runnable(&blocks[0]));
    assert_eq!(runner.run_code_block(&blocks[0]), Dispatch::NoRunner);
    assert!(runner.engine().running_targets().is_empty());
    assert_eq!(
        sink.text(),
        "[warn] No runner configured for language: shellscript\n"
    );
}
