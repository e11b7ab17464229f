use std::process::ExitCode;

use clap::Parser;
use simple_runner_cli::Cli;
use simple_runner_cli::run_main;

fn main() -> anyhow::Result<ExitCode> {
    run_main(Cli::parse())
}
