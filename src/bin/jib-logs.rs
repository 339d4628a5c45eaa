//! `jib-logs`: list, show, search, and prune captured sandbox run logs
//! (spec §3 "Run correlation", §4.3 "Log and correlation policy"). Reads
//! `sharing/container-logs/runs/<origin>/<run_id>.log` and the
//! `by-context/<context_id>/` alias tree directly; there is no daemon
//! round-trip since logs are plain files on the shared instance directory.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "jib-logs", version)]
#[command(about = "inspect captured sandbox run logs")]
struct Cli {
    #[command(subcommand)]
    command: Command,

    #[arg(long, global = true)]
    instance_dir: Option<PathBuf>,
}

#[derive(Subcommand)]
enum Command {
    /// List captured runs, most recent first.
    List {
        /// Restrict to one trigger origin (timer, chat, pr-event, manual).
        #[arg(long)]
        origin: Option<String>,
        /// Restrict to runs correlated with this context id.
        #[arg(long)]
        context: Option<String>,
        #[arg(long, default_value_t = 50)]
        limit: usize,
    },
    /// Print a single run's captured output by run id.
    Show { run_id: String },
    /// Search captured output across all runs for a literal substring.
    Search {
        pattern: String,
        #[arg(long, default_value_t = 200)]
        max_matches: usize,
    },
    /// Delete run logs older than the given number of days.
    Prune {
        #[arg(long, default_value_t = 30)]
        older_than_days: u64,
        /// Report what would be deleted without deleting anything.
        #[arg(long)]
        dry_run: bool,
    },
}

struct RunLog {
    origin: String,
    run_id: String,
    path: PathBuf,
    modified: std::time::SystemTime,
    size_bytes: u64,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let instance_dir = cli.instance_dir.unwrap_or_else(jib::config::Config::default_instance_dir);
    let config = jib::config::Config::load_from(&instance_dir).context("failed to load configuration")?;
    let runs_dir = config.container_logs_dir().join("runs");

    match cli.command {
        Command::List { origin, context, limit } => cmd_list(&config, &runs_dir, origin, context, limit),
        Command::Show { run_id } => cmd_show(&runs_dir, &run_id),
        Command::Search { pattern, max_matches } => cmd_search(&runs_dir, &pattern, max_matches),
        Command::Prune { older_than_days, dry_run } => cmd_prune(&runs_dir, older_than_days, dry_run),
    }
}

fn walk_runs(runs_dir: &Path) -> anyhow::Result<Vec<RunLog>> {
    let mut logs = Vec::new();
    if !runs_dir.exists() {
        return Ok(logs);
    }
    for origin_entry in std::fs::read_dir(runs_dir).with_context(|| format!("failed to read {}", runs_dir.display()))? {
        let origin_entry = origin_entry?;
        if !origin_entry.file_type()?.is_dir() {
            continue;
        }
        let origin = origin_entry.file_name().to_string_lossy().into_owned();
        for log_entry in std::fs::read_dir(origin_entry.path())? {
            let log_entry = log_entry?;
            let path = log_entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("log") {
                continue;
            }
            let run_id = path.file_stem().unwrap_or_default().to_string_lossy().into_owned();
            let metadata = log_entry.metadata()?;
            logs.push(RunLog {
                origin: origin.clone(),
                run_id,
                path,
                modified: metadata.modified()?,
                size_bytes: metadata.len(),
            });
        }
    }
    logs.sort_by(|a, b| b.modified.cmp(&a.modified));
    Ok(logs)
}

fn cmd_list(
    config: &jib::config::Config,
    runs_dir: &Path,
    origin_filter: Option<String>,
    context_filter: Option<String>,
    limit: usize,
) -> anyhow::Result<()> {
    let run_ids_for_context = context_filter.map(|context_id| {
        let index = jib::container::CorrelationIndex::load(&config.container_logs_dir())
            .expect("correlation index should load for a list that filters by context");
        index
            .run_ids_for_context(&context_id)
            .into_iter()
            .map(|id| id.to_string())
            .collect::<std::collections::HashSet<_>>()
    });

    let mut logs = walk_runs(runs_dir)?;
    if let Some(origin) = &origin_filter {
        logs.retain(|l| &l.origin == origin);
    }
    if let Some(ids) = &run_ids_for_context {
        logs.retain(|l| ids.contains(&l.run_id));
    }

    for log in logs.into_iter().take(limit) {
        let age = log.modified.elapsed().map(|d| d.as_secs()).unwrap_or(0);
        println!("{:<10} {:<36} {:>8}B  {}s ago  {}", log.origin, log.run_id, log.size_bytes, age, log.path.display());
    }
    Ok(())
}

fn cmd_show(runs_dir: &Path, run_id: &str) -> anyhow::Result<()> {
    let logs = walk_runs(runs_dir)?;
    let log = logs
        .into_iter()
        .find(|l| l.run_id == run_id)
        .with_context(|| format!("no captured run found with id {run_id}"))?;
    let content = std::fs::read_to_string(&log.path).with_context(|| format!("failed to read {}", log.path.display()))?;
    print!("{content}");
    Ok(())
}

fn cmd_search(runs_dir: &Path, pattern: &str, max_matches: usize) -> anyhow::Result<()> {
    let logs = walk_runs(runs_dir)?;
    let mut matches = 0;
    for log in logs {
        let Ok(content) = std::fs::read_to_string(&log.path) else {
            continue;
        };
        for (line_no, line) in content.lines().enumerate() {
            if line.contains(pattern) {
                println!("{}:{}:{}: {}", log.run_id, log.origin, line_no + 1, line);
                matches += 1;
                if matches >= max_matches {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

fn cmd_prune(runs_dir: &Path, older_than_days: u64, dry_run: bool) -> anyhow::Result<()> {
    let threshold = std::time::Duration::from_secs(older_than_days * 86_400);
    let logs = walk_runs(runs_dir)?;
    let mut pruned = 0;
    for log in logs {
        let age = log.modified.elapsed().unwrap_or_default();
        if age < threshold {
            continue;
        }
        if dry_run {
            println!("would prune {} ({})", log.path.display(), log.run_id);
        } else {
            std::fs::remove_file(&log.path).with_context(|| format!("failed to remove {}", log.path.display()))?;
            println!("pruned {} ({})", log.path.display(), log.run_id);
        }
        pruned += 1;
    }
    println!("{}{} run log(s)", if dry_run { "would prune " } else { "pruned " }, pruned);
    Ok(())
}
