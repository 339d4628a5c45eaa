//! `apply-staged`: the human-facing apply tool (spec §4.7, §8 Scenario F).
//! Walks every drop in `sharing/staged-changes/`, stages its changes into a
//! dedicated review worktree, shows the diff, and on confirmation commits
//! with the fixed co-author footer and archives the drop. Declining leaves
//! the drop in place for a later run.

use anyhow::Context as _;
use clap::Parser;
use dialoguer::{theme::ColorfulTheme, Confirm, Input};
use jib::staging::{self, apply};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "apply-staged", version)]
#[command(about = "review and apply staged agent changes")]
struct Cli {
    #[arg(long)]
    instance_dir: Option<PathBuf>,

    /// Apply a single drop by slug instead of walking the whole queue.
    #[arg(long)]
    slug: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let instance_dir = cli.instance_dir.unwrap_or_else(jib::config::Config::default_instance_dir);
    let config = jib::config::Config::load_from(&instance_dir).context("failed to load configuration")?;
    let policy = jib::policy::PolicyStore::load(&config.repositories_path()).context("failed to load repository policy")?;

    let theme = ColorfulTheme::default();
    let drops = staging::list_drops(&config.staged_changes_dir()).context("failed to list staged drops")?;
    let drops: Vec<_> = match &cli.slug {
        Some(slug) => drops.into_iter().filter(|d| &d.slug == slug).collect(),
        None => drops,
    };

    if drops.is_empty() {
        println!("no staged changes to review.");
        return Ok(());
    }

    for drop in drops {
        println!("\n=== {} ===", drop.slug);
        println!("{}", drop.changes_md);

        let repo_full_name = match staging::detect_target_repo(&drop) {
            Ok(repo) => repo,
            Err(_) => Input::with_theme(&theme)
                .with_prompt(format!("Could not auto-detect target repository for '{}'; enter org/name", drop.slug))
                .interact_text()?,
        };

        let Some(policy_record) = policy.lookup(&repo_full_name) else {
            eprintln!("skipping '{}': '{repo_full_name}' is not a known repository in policy", drop.slug);
            continue;
        };

        let remote_url = format!("https://github.com/{}.git", policy_record.full_name);
        let worktree_path = match prepare_review_worktree(&config, &policy_record.full_name, &remote_url).await {
            Ok(path) => path,
            Err(error) => {
                eprintln!("skipping '{}': failed to prepare review worktree: {error}", drop.slug);
                continue;
            }
        };

        let plan = match apply::stage(&worktree_path, &drop).await {
            Ok(plan) => plan,
            Err(error) => {
                eprintln!("skipping '{}': failed to stage changes: {error}", drop.slug);
                continue;
            }
        };

        println!("strategy: {:?}", plan.strategy);
        println!("{}", plan.diff_preview);

        if !Confirm::with_theme(&theme).with_prompt(format!("Apply '{}' to {repo_full_name}?", drop.slug)).default(true).interact()?
        {
            println!("discarding staged changes for '{}' (drop left in place)", drop.slug);
            if let Err(error) = apply::discard(&worktree_path).await {
                eprintln!("warning: failed to reset review worktree: {error}");
            }
            continue;
        }

        let agent_identity: String = Input::with_theme(&theme)
            .with_prompt("Co-author attribution for the commit")
            .default("jib-agent <jib-agent@users.noreply.github.com>".to_string())
            .interact_text()?;

        match apply::commit(&worktree_path, &drop, &agent_identity).await {
            Ok(sha) => println!("committed {sha} on {repo_full_name}"),
            Err(error) => {
                eprintln!("failed to commit '{}': {error}", drop.slug);
                continue;
            }
        }

        match apply::archive(&config.staged_changes_archive_dir(), &drop).await {
            Ok(dest) => println!("archived to {}", dest.display()),
            Err(error) => eprintln!("warning: commit succeeded but archiving failed: {error}"),
        }
    }

    Ok(())
}

/// A dedicated review worktree, separate from any sandbox session's
/// per-container worktrees, reusing the same shared-store/worktree-add
/// convention under a fixed pseudo-container id (spec §4.2's "working
/// directory per container" generalizes to "per reviewing process" here).
async fn prepare_review_worktree(
    config: &jib::config::Config,
    repo_full_name: &str,
    remote_url: &str,
) -> anyhow::Result<PathBuf> {
    use jib::gateway::worktree;

    let store_path = worktree::shared_store_path(&config.worktrees_dir(), repo_full_name);
    worktree::ensure_shared_store(&store_path, remote_url).await?;

    let container_id: jib::ContainerId = std::sync::Arc::from("apply-staged");
    let working_dir = worktree::container_worktree_path(&config.worktrees_dir(), repo_full_name, &container_id);

    if !working_dir.exists() {
        worktree::create(&store_path, &working_dir, &container_id, &std::sync::Arc::from(repo_full_name)).await?;
    }

    Ok(working_dir)
}
