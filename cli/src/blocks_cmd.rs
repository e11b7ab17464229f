use std::path::Path;
use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::Context;
use anyhow::Result;
use clap::Args;
use serde::Serialize;
use simple_runner_core::CodeBlock;

use crate::RunnerContext;

#[derive(Debug, Args)]
pub struct BlocksArgs {
    /// Markdown document to scan.
    #[arg(value_name = "FILE")]
    pub document: PathBuf,

    /// Print the blocks as a JSON array.
    #[arg(long, default_value_t = false, conflicts_with = "content")]
    pub json: bool,

    /// Print only the content of the block with this number (1-based).
    #[arg(long, value_name = "N")]
    pub content: Option<usize>,
}

#[derive(Debug, Serialize)]
struct BlockSummary<'a> {
    number: usize,
    tag: &'a str,
    language: &'a str,
    extension: &'a str,
    /// 1-based, inclusive, fences included.
    start_line: usize,
    end_line: usize,
    runnable: bool,
    content: &'a str,
}

pub(crate) fn run(context: &RunnerContext, args: BlocksArgs) -> Result<ExitCode> {
    let blocks = read_blocks(context, &args.document)?;

    if let Some(number) = args.content {
        let block = pick(&blocks, number, &args.document)?;
        print!("{}", block.content);
        return Ok(ExitCode::SUCCESS);
    }

    let summaries: Vec<BlockSummary<'_>> = blocks
        .iter()
        .enumerate()
        .map(|(idx, block)| BlockSummary {
            number: idx + 1,
            tag: &block.tag,
            language: block.language_id().as_str(),
            extension: block.file_extension(),
            start_line: block.start_line + 1,
            end_line: block.end_line + 1,
            runnable: context.runner.runnable(block),
            content: &block.content,
        })
        .collect();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&summaries)?);
        return Ok(ExitCode::SUCCESS);
    }

    if summaries.is_empty() {
        println!("No code blocks found in {}.", args.document.display());
        return Ok(ExitCode::SUCCESS);
    }
    println!("{:>3}  {:<11}  {:<14}  {}", "#", "Lines", "Language", "Runnable");
    for summary in &summaries {
        let language = if summary.language.is_empty() {
            "-"
        } else {
            summary.language
        };
        println!(
            "{:>3}  {:<11}  {:<14}  {}",
            summary.number,
            format!("{}-{}", summary.start_line, summary.end_line),
            language,
            if summary.runnable { "yes" } else { "no" }
        );
    }
    Ok(ExitCode::SUCCESS)
}

pub(crate) fn read_blocks(context: &RunnerContext, document: &Path) -> Result<Vec<CodeBlock>> {
    let text = std::fs::read_to_string(document)
        .with_context(|| format!("failed to read {}", document.display()))?;
    Ok(context.runner.code_blocks(&text))
}

pub(crate) fn pick<'a>(
    blocks: &'a [CodeBlock],
    number: usize,
    document: &Path,
) -> Result<&'a CodeBlock> {
    number
        .checked_sub(1)
        .and_then(|idx| blocks.get(idx))
        .with_context(|| {
            format!(
                "{} has {} code block(s); there is no block {number}",
                document.display(),
                blocks.len()
            )
        })
}
