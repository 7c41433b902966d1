//! `threadscope scan` - one-shot parse of conversation files.

use anyhow::{Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use threadscope_core::ingest::Parser;
use threadscope_core::pipeline::{scan_file, ScanReport};
use threadscope_core::threading::Threader;
use threadscope_core::watcher::discover;
use threadscope_core::{Config, Severity};

#[derive(Args)]
pub struct ScanArgs {
    /// A conversation file, or a root directory of project folders
    path: PathBuf,

    /// Print the reports as JSON instead of a summary
    #[arg(long)]
    json: bool,

    /// Show every thread and parse error
    #[arg(short, long)]
    verbose: bool,
}

pub fn run(config: Config, args: ScanArgs) -> Result<()> {
    config.validate().context("invalid configuration")?;

    let files = if args.path.is_dir() {
        discover(&args.path, &config.watcher.extension)
            .with_context(|| format!("failed to list {}", args.path.display()))?
    } else {
        vec![args.path.clone()]
    };

    let parser = Arc::new(Parser::new());
    let threader = Arc::new(Threader::new(config.threading.clone()));

    let pb = if args.json {
        ProgressBar::hidden()
    } else {
        ProgressBar::new(files.len() as u64)
    };
    pb.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{bar:40.cyan/blue}] {pos}/{len} {msg}")
            .context("invalid progress template")?
            .progress_chars("#>-"),
    );

    let mut reports = Vec::with_capacity(files.len());
    for path in &files {
        pb.set_message(file_label(path));
        let report = scan_file(
            path,
            parser.clone(),
            threader.clone(),
            config.pipeline.max_batch_lines,
        )
        .with_context(|| format!("failed to scan {}", path.display()))?;
        reports.push(report);
        pb.inc(1);
    }
    pb.finish_and_clear();

    if args.json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
    } else {
        print_summary(&reports, args.verbose);
    }
    Ok(())
}

fn file_label(path: &Path) -> String {
    path.file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("...")
        .to_string()
}

fn print_summary(reports: &[ScanReport], verbose: bool) {
    for report in reports {
        let errors = report
            .parse_errors
            .iter()
            .filter(|e| e.severity == Severity::Error)
            .count();
        println!(
            "{}/{}: {} messages, {} tool calls ({} pending), {} threads, {} errors, {} warnings",
            report.project_id,
            report.conversation_id,
            report.messages,
            report.tool_calls,
            report.pending_tool_calls,
            report.threads.len(),
            errors,
            report.parse_errors.len() - errors,
        );

        if verbose {
            for thread in &report.threads {
                println!(
                    "  [{}] {} messages, {} -> {} ({}, confidence {:.2})",
                    thread.topic.as_deref().unwrap_or("-"),
                    thread.message_ids.len(),
                    thread.started_at.format("%H:%M:%S"),
                    thread.ended_at.format("%H:%M:%S"),
                    thread.boundary.as_str(),
                    thread.confidence,
                );
            }
            for error in &report.parse_errors {
                println!(
                    "  line {}: {} ({})",
                    error.line_number,
                    error.description,
                    error.severity.as_str()
                );
            }
        }
    }

    let messages: usize = reports.iter().map(|r| r.messages).sum();
    let threads: usize = reports.iter().map(|r| r.threads.len()).sum();
    println!(
        "\nScanned {} file(s): {} messages, {} threads",
        reports.len(),
        messages,
        threads
    );
}
