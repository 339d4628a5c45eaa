//! Container lifecycle manager (spec §4.3): turns an event or manual
//! invocation into a sandbox run with the right mounts, environment, and
//! correlation. Grounded on `acp::process::AcpProcess`'s spawn/kill/capture
//! shape, generalized from a local subprocess to a `bollard`-managed
//! container plus an exec channel into it.

use crate::container::correlation::CorrelationIndex;
use crate::error::{ContainerError, Result};
use crate::gateway::worktree::{self, WorktreeIndex, WorktreeRecord};
use crate::git::mount::{mounts_for_repo, wrapper_mounts, ContainerMount, MountKind};
use crate::policy::RepoRole;
use crate::{config::Config, ContainerId, ContextId, RepoFullName, RunId, RunOrigin};
use anyhow::Context as _;
use bollard::container::{Config as DockerConfig, CreateContainerOptions, RemoveContainerOptions, StartContainerOptions};
use bollard::exec::{CreateExecOptions, StartExecResults};
use bollard::models::{HostConfig, Mount as DockerMount, MountTypeEnum};
use bollard::Docker;
use futures::StreamExt;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;

/// A repository to mount into a new session, and whether the sandbox may
/// push to it (spec §4.3 "a set of repositories (writable/readable)").
#[derive(Debug, Clone)]
pub struct RepoMount {
    pub full_name: RepoFullName,
    pub role: RepoRole,
    pub remote_url: String,
}

#[derive(Debug, Clone)]
pub struct StartSessionInput {
    pub user_identity: String,
    pub repos: Vec<RepoMount>,
    pub private_mode: bool,
    pub initial_prompt: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ExecInput {
    pub container_id: ContainerId,
    pub argv: Vec<String>,
    pub run_id: RunId,
    pub origin: RunOrigin,
    pub context_id: Option<ContextId>,
    pub thread_ts: Option<String>,
    pub repo_full_name: RepoFullName,
}

pub struct ExecOutcome {
    pub run_id: RunId,
    pub exit_status: Option<i32>,
    pub logs_path: std::path::PathBuf,
    pub timed_out: bool,
}

pub struct ContainerManager {
    docker: Docker,
    config: Arc<Config>,
    worktrees: Arc<RwLock<WorktreeIndex>>,
    active_containers: Arc<RwLock<HashSet<ContainerId>>>,
    correlation: Arc<CorrelationIndex>,
    /// Shared with [`crate::gateway::state::GatewayState`] so a session
    /// started with `private_mode` also gates the gateway's own
    /// visibility-blocked reads and stripped model-request tools (spec
    /// §4.1, §4.3 "Start-a-session operation").
    private_mode: Arc<std::sync::atomic::AtomicBool>,
}

impl ContainerManager {
    pub fn new(
        config: Arc<Config>,
        worktrees: Arc<RwLock<WorktreeIndex>>,
        active_containers: Arc<RwLock<HashSet<ContainerId>>>,
        correlation: Arc<CorrelationIndex>,
        private_mode: Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the docker daemon")
            .map_err(ContainerError::Other)?;
        Ok(Self { docker, config, worktrees, active_containers, correlation, private_mode })
    }

    /// Start-a-session operation (spec §4.3): one worktree per repo, the
    /// wrapper binaries standing in for `git`/`gh`, the model base URL
    /// pointed at the gateway, and no credentials in the container's
    /// environment for model, code-hosting, chat, or ticketing.
    pub async fn start_session(&self, input: StartSessionInput) -> Result<ContainerId> {
        self.private_mode
            .store(input.private_mode, std::sync::atomic::Ordering::Relaxed);

        let container_id: ContainerId = Arc::from(uuid::Uuid::new_v4().to_string());

        let mut mounts: Vec<ContainerMount> = wrapper_mounts(
            &self.config.container.git_wrapper_path,
            &self.config.container.gh_wrapper_path,
        );
        let mut mounted_repos = Vec::with_capacity(input.repos.len());

        for repo in &input.repos {
            let store_path = worktree::shared_store_path(&self.config.worktrees_dir(), &repo.full_name);
            worktree::ensure_shared_store(&store_path, &repo.remote_url).await?;

            let working_dir = worktree::container_worktree_path(
                &self.config.worktrees_dir(),
                &repo.full_name,
                &container_id,
            );
            let record = worktree::create(&store_path, &working_dir, &container_id, &repo.full_name).await?;

            mounts.extend(mounts_for_repo(&repo.full_name, &record.working_dir_path, &self.config.container.container_workdir_root));
            self.worktrees.write().await.insert(record);
            mounted_repos.push(repo.full_name.to_string());
        }

        let env = session_env(&self.config, &container_id, &mounted_repos, input.private_mode, input.initial_prompt.as_deref());

        let host_config = HostConfig {
            binds: Some(bind_strings(&mounts)),
            tmpfs: Some(tmpfs_map(&mounts)),
            ..Default::default()
        };
        let docker_config = DockerConfig {
            image: Some(self.config.container.image.clone()),
            env: Some(env),
            host_config: Some(host_config),
            tty: Some(true),
            ..Default::default()
        };

        let create_options = CreateContainerOptions { name: container_id.to_string(), platform: None };
        self.docker
            .create_container(Some(create_options), docker_config)
            .await
            .context("failed to create sandbox container")
            .map_err(ContainerError::Other)?;
        self.docker
            .start_container(&container_id, None::<StartContainerOptions<String>>)
            .await
            .context("failed to start sandbox container")
            .map_err(ContainerError::Other)?;

        self.active_containers.write().await.insert(container_id.clone());
        tracing::info!(container_id = %container_id, repos = mounted_repos.len(), "sandbox container started");

        Ok(container_id)
    }

    /// Exec-in-running operation (spec §4.3): a fresh working branch under
    /// the container's namespace, an exec channel for `input.argv`, output
    /// captured to a log file, and a run-correlation record on exit.
    pub async fn exec_in_running(&self, input: ExecInput) -> Result<ExecOutcome> {
        if !self.active_containers.read().await.contains(&input.container_id) {
            return Err(ContainerError::NoActiveContainer.into());
        }

        let record = {
            let guard = self.worktrees.read().await;
            guard
                .get(&input.container_id, &input.repo_full_name)
                .cloned()
                .ok_or_else(|| ContainerError::NotFound { id: input.container_id.to_string() })?
        };
        self.checkout_fresh_branch(&record).await?;

        let logs_path = self.correlation.log_path(input.origin, input.run_id)?;
        let mut log_file = tokio::fs::File::create(&logs_path)
            .await
            .with_context(|| format!("failed to create run log file: {}", logs_path.display()))?;

        let exec = self
            .docker
            .create_exec(
                &input.container_id,
                CreateExecOptions {
                    attach_stdout: Some(true),
                    attach_stderr: Some(true),
                    cmd: Some(input.argv.clone()),
                    working_dir: Some(record.working_dir_path.to_string_lossy().into_owned()),
                    ..Default::default()
                },
            )
            .await
            .context("failed to create exec channel")
            .map_err(ContainerError::Other)?;

        let timeout = std::time::Duration::from_secs(self.config.dispatcher.analyzer_timeout_secs);
        let run_future = self.drain_exec(&exec.id, &mut log_file);

        let (exit_status, timed_out) = match tokio::time::timeout(timeout, run_future).await {
            Ok(result) => (result?, false),
            Err(_) => {
                tracing::warn!(run_id = %input.run_id, container_id = %input.container_id, "analyzer exec timed out");
                (None, true)
            }
        };

        self.correlation.record(input.context_id.as_ref(), input.run_id, &logs_path)?;

        Ok(ExecOutcome { run_id: input.run_id, exit_status, logs_path, timed_out })
    }

    async fn drain_exec(&self, exec_id: &str, log_file: &mut tokio::fs::File) -> Result<Option<i32>> {
        let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(exec_id, None)
            .await
            .context("failed to start exec channel")
            .map_err(ContainerError::Other)?
        else {
            return Err(ContainerError::Other(anyhow::anyhow!("exec channel was not attached")).into());
        };

        while let Some(chunk) = output.next().await {
            let chunk = chunk.context("exec output stream error").map_err(ContainerError::Other)?;
            log_file
                .write_all(chunk.into_bytes().as_ref())
                .await
                .context("failed to write exec output to log file")?;
        }

        let inspect = self
            .docker
            .inspect_exec(exec_id)
            .await
            .context("failed to inspect exec result")
            .map_err(ContainerError::Other)?;
        Ok(inspect.exit_code.map(|c| c as i32))
    }

    async fn checkout_fresh_branch(&self, record: &WorktreeRecord) -> Result<()> {
        let slug = format!("run-{}", uuid::Uuid::new_v4().simple());
        let branch = worktree::branch_name(&record.container_id, &slug);
        let status = tokio::process::Command::new("git")
            .current_dir(&record.working_dir_path)
            .args(["checkout", "-b", &branch])
            .status()
            .await
            .context("failed to spawn git checkout -b")?;
        if !status.success() {
            return Err(ContainerError::StartFailed(format!("failed to create working branch {branch}")).into());
        }
        Ok(())
    }

    /// On run exit: tear down the container, drop it from the active set,
    /// and optionally remove its worktrees via the gateway (spec §4.3
    /// Cleanup).
    pub async fn cleanup(&self, container_id: &ContainerId, remove_worktrees: bool) -> Result<()> {
        self.active_containers.write().await.remove(container_id);

        let _ = self
            .docker
            .remove_container(container_id, Some(RemoveContainerOptions { force: true, ..Default::default() }))
            .await;

        if remove_worktrees {
            let records: Vec<WorktreeRecord> =
                self.worktrees.read().await.list().into_iter().filter(|r| &r.container_id == container_id).collect();
            for record in records {
                let store_path = worktree::shared_store_path(&self.config.worktrees_dir(), &record.repo_full_name);
                let _ = worktree::destroy(&store_path, &record).await;
                self.worktrees.write().await.remove(&record.container_id, &record.repo_full_name);
            }
        }

        Ok(())
    }

    /// The first active container, if any (spec §4.5 Dispatch: "if no
    /// container is running... starts one"). Arbitrary among ties — the
    /// dispatcher only cares whether *a* session exists to exec into.
    pub async fn any_active(&self) -> Option<ContainerId> {
        self.active_containers.read().await.iter().next().cloned()
    }

    /// Sweep worktrees whose `container_id` is not in the active-container
    /// set — run on container shutdown and on gateway startup (spec §4.2
    /// "Crash recovery", §4.3 Cleanup).
    pub async fn sweep_orphans(&self) -> Result<Vec<WorktreeRecord>> {
        let active = self.active_containers.read().await.clone();
        let orphans = self.worktrees.read().await.orphans(&active);

        let mut swept = Vec::with_capacity(orphans.len());
        for record in orphans {
            let store_path = worktree::shared_store_path(&self.config.worktrees_dir(), &record.repo_full_name);
            let had_uncommitted = worktree::destroy(&store_path, &record).await.unwrap_or(false);
            self.worktrees.write().await.remove(&record.container_id, &record.repo_full_name);
            tracing::info!(
                container_id = %record.container_id,
                repo = %record.repo_full_name,
                had_uncommitted,
                "swept orphan worktree"
            );
            swept.push(record);
        }
        Ok(swept)
    }
}

fn session_env(
    config: &Config,
    container_id: &ContainerId,
    mounted_repos: &[String],
    private_mode: bool,
    initial_prompt: Option<&str>,
) -> Vec<String> {
    let mut env = vec![
        format!("ANTHROPIC_BASE_URL={}", config.container.gateway_internal_url),
        format!("JIB_CONTAINER_ID={container_id}"),
        format!("JIB_REPOS={}", mounted_repos.join(",")),
        format!("JIB_PRIVATE_MODE={private_mode}"),
    ];
    if let Some(prompt) = initial_prompt {
        env.push(format!("JIB_INITIAL_PROMPT={prompt}"));
    }
    env
}

fn bind_strings(mounts: &[ContainerMount]) -> Vec<String> {
    mounts
        .iter()
        .filter_map(|m| match (&m.host_path, m.kind) {
            (Some(host), MountKind::Bind { read_only }) => {
                let suffix = if read_only { ":ro" } else { "" };
                Some(format!("{}:{}{}", host.display(), m.container_path.display(), suffix))
            }
            _ => None,
        })
        .collect()
}

fn tmpfs_map(mounts: &[ContainerMount]) -> std::collections::HashMap<String, String> {
    mounts
        .iter()
        .filter(|m| matches!(m.kind, MountKind::TmpfsShadow))
        .map(|m| (m.container_path.to_string_lossy().into_owned(), String::new()))
        .collect()
}

#[allow(dead_code)]
fn docker_mount_fallback(mount: &ContainerMount) -> DockerMount {
    // Retained for the rare host where bind-string parsing is unavailable and
    // the structured `Mount` type must be used instead.
    DockerMount {
        target: Some(mount.container_path.to_string_lossy().into_owned()),
        source: mount.host_path.as_ref().map(|p| p.to_string_lossy().into_owned()),
        typ: Some(match mount.kind {
            MountKind::Bind { .. } => MountTypeEnum::BIND,
            MountKind::TmpfsShadow => MountTypeEnum::TMPFS,
        }),
        read_only: Some(matches!(mount.kind, MountKind::Bind { read_only: true })),
        ..Default::default()
    }
}
