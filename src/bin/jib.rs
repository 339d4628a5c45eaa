//! `jib`: the operator-facing CLI. With no flags it starts a sandbox session
//! against every repository in policy; `--exec` runs a command against the
//! currently running session instead; `--rebuild` rebuilds the sandbox image
//! (spec §6 CLI surface).

use anyhow::Context as _;
use clap::Parser;

#[derive(Parser)]
#[command(name = "jib", version)]
#[command(about = "start or drive a jib sandbox session")]
struct Cli {
    /// Run the session in private mode: gateway reads are blocked against
    /// repository visibility and the model request loses the chat/code tools.
    #[arg(long)]
    private: bool,

    /// Seed the session with an initial prompt instead of waiting on chat.
    #[arg(long)]
    prompt: Option<String>,

    /// Run a command against the currently running session's container
    /// instead of starting a new one.
    #[arg(long, num_args = 1.., value_name = "ARGV")]
    exec: Option<Vec<String>>,

    /// With `--exec`, check out a fresh isolated working branch before
    /// running the command (spec §6 "exec with a fresh isolated worktree").
    #[arg(long, requires = "exec")]
    worktree: bool,

    /// Repository to target for `--exec` (defaults to the first writable
    /// repository in policy).
    #[arg(long, requires = "exec")]
    repo: Option<String>,

    /// Rebuild the sandbox image before the next session starts.
    #[arg(long, conflicts_with_all = ["exec", "private", "prompt"])]
    rebuild: bool,

    #[arg(long, global = true)]
    instance_dir: Option<std::path::PathBuf>,
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let instance_dir = cli
        .instance_dir
        .clone()
        .unwrap_or_else(jib::config::Config::default_instance_dir);
    let paths = jib::daemon::DaemonPaths::new(&instance_dir);

    if jib::daemon::is_running(&paths).is_none() {
        eprintln!("jib-hostd is not running. Start it with `jib-hostd start` first.");
        std::process::exit(1);
    }

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    runtime.block_on(async {
        let command = if cli.rebuild {
            jib::daemon::IpcCommand::RebuildImage
        } else if let Some(argv) = cli.exec {
            // `--worktree` is a no-op flag at the IPC layer: the container
            // manager always checks out a fresh branch per exec (spec §4.3
            // "Exec-in-running operation"), so the flag exists for CLI
            // discoverability rather than changing behavior here.
            let _ = cli.worktree;
            jib::daemon::IpcCommand::ExecRunning { argv, repo: cli.repo }
        } else {
            jib::daemon::IpcCommand::StartSession { private_mode: cli.private, initial_prompt: cli.prompt }
        };

        match jib::daemon::send_command(&paths, command).await {
            Ok(jib::daemon::IpcResponse::SessionStarted { container_id }) => {
                println!("session started: {container_id}");
                Ok(())
            }
            Ok(jib::daemon::IpcResponse::ExecFinished { exit_status, logs_path, timed_out }) => {
                if timed_out {
                    eprintln!("exec timed out; partial output logged to {logs_path}");
                    std::process::exit(1);
                }
                println!("exec finished: exit_status={exit_status:?}, logs={logs_path}");
                if exit_status.unwrap_or(1) != 0 {
                    std::process::exit(exit_status.unwrap_or(1));
                }
                Ok(())
            }
            Ok(jib::daemon::IpcResponse::Error { message }) => {
                eprintln!("jib-hostd reported an error: {message}");
                std::process::exit(1);
            }
            Ok(_) => {
                eprintln!("unexpected response from jib-hostd");
                std::process::exit(1);
            }
            Err(error) => {
                eprintln!("failed to reach jib-hostd: {error}");
                std::process::exit(1);
            }
        }
    })
}
