use anyhow::{Context, Result};
use clap::Parser;
use class_downgrader::archive::{self, Entry, InputKind};
use class_downgrader::batch::{BatchOutcome, CancelToken, downgrade_all_with};
use class_downgrader::cli::Cli;
use class_downgrader::config::{check_paths, init_logging, resolve_policy, resolve_threads};
use class_downgrader::pipeline::Downgrader;
use class_downgrader::report::{EntryReport, Outcome, RunReport};
use std::process::ExitCode;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Instant;

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging();

    match run(&cli) {
        Ok(code) => code,
        Err(err) => {
            tracing::error!("{err:#}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: &Cli) -> Result<ExitCode> {
    let started = Instant::now();
    check_paths(&cli.input, &cli.output)?;
    let policy = resolve_policy(cli)?;
    let threads = resolve_threads(cli);
    let kind = InputKind::of(&cli.input)?;

    tracing::info!(input = %cli.input.display(), "reading input");
    let entries = archive::read_entries(&cli.input, kind)?;
    let class_indices: Vec<usize> = entries
        .iter()
        .enumerate()
        .filter(|(_, e)| e.is_class())
        .map(|(i, _)| i)
        .collect();
    let inputs: Vec<&[u8]> = class_indices.iter().map(|&i| entries[i].bytes.as_slice()).collect();

    tracing::info!(
        classes = inputs.len(),
        resources = entries.len() - inputs.len(),
        threads,
        target = %policy.target(),
        "downgrading classes"
    );
    let pool = rayon::ThreadPoolBuilder::new()
        .num_threads(threads)
        .build()
        .context("failed to build worker pool")?;
    let downgrader = Downgrader::new(policy);
    let cancel = CancelToken::new();
    let total = inputs.len();
    let step = (total / 10).max(1);
    let done = AtomicUsize::new(0);
    let outcomes = pool.install(|| {
        downgrade_all_with(&downgrader, &inputs, &cancel, |_| {
            let n = done.fetch_add(1, Ordering::Relaxed) + 1;
            if n % step == 0 || n == total {
                tracing::info!(processed = n, total, "progress");
            }
        })
    });

    let mut report = RunReport {
        input: cli.input.display().to_string(),
        output: cli.output.display().to_string(),
        target: policy.target(),
        threads,
        elapsed_ms: 0,
        downgraded: 0,
        unchanged: 0,
        failed: 0,
        copied: 0,
        entries: Vec::with_capacity(entries.len()),
    };
    let mut outcomes = class_indices.into_iter().zip(outcomes).peekable();
    let mut output = Vec::with_capacity(entries.len());
    for (i, entry) in entries.iter().enumerate() {
        let outcome = match outcomes.peek() {
            Some((index, _)) if *index == i => outcomes.next().map(|(_, o)| o),
            _ => None,
        };
        let (bytes, entry_report) = settle(entry, outcome);
        report.entries.push(entry_report);
        output.push(Entry {
            name: entry.name.clone(),
            bytes,
        });
    }

    tracing::info!(output = %cli.output.display(), "writing output");
    archive::write_entries(&cli.output, kind, &output)?;

    report.elapsed_ms = started.elapsed().as_millis();
    report.tally();
    if let Some(path) = &cli.report {
        let json = serde_json::to_string_pretty(&report)?;
        std::fs::write(path, json).with_context(|| format!("cannot write report: {}", path.display()))?;
    }

    tracing::info!(
        downgraded = report.downgraded,
        unchanged = report.unchanged,
        failed = report.failed,
        copied = report.copied,
        elapsed_ms = report.elapsed_ms as u64,
        "done"
    );
    if report.failed > 0 && !cli.keep_going {
        return Ok(ExitCode::from(1));
    }
    Ok(ExitCode::SUCCESS)
}

/// Bytes to write for `entry` and its report line. Failed classes keep
/// their original bytes.
fn settle(entry: &Entry, outcome: Option<BatchOutcome>) -> (Vec<u8>, EntryReport) {
    match outcome {
        None => (
            entry.bytes.clone(),
            EntryReport::new(&entry.name, Outcome::Copied, &entry.bytes, &entry.bytes),
        ),
        Some(BatchOutcome::Downgraded(out)) => {
            let kind = if out.changed { Outcome::Downgraded } else { Outcome::Unchanged };
            let report = EntryReport {
                class_name: Some(out.class_name),
                version: Some(out.version),
                diagnostic: Some(out.diagnostic),
                ..EntryReport::new(&entry.name, kind, &entry.bytes, &out.bytes)
            };
            (out.bytes, report)
        }
        Some(BatchOutcome::Failed(err)) => {
            tracing::warn!(entry = %entry.name, "copying original bytes of failed class");
            let report = EntryReport {
                class_name: err.class_name().map(str::to_string),
                error_kind: Some(err.kind()),
                error: Some(err.to_string()),
                ..EntryReport::new(&entry.name, Outcome::Failed, &entry.bytes, &entry.bytes)
            };
            (entry.bytes.clone(), report)
        }
        Some(BatchOutcome::Cancelled) => (
            entry.bytes.clone(),
            EntryReport::new(&entry.name, Outcome::Cancelled, &entry.bytes, &entry.bytes),
        ),
    }
}
