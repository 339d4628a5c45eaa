//! `jib-hostd`: the host daemon. Owns the gateway HTTP API, the chat bridge,
//! the container lifecycle manager, the event dispatcher, and the IPC
//! surface the `jib`/`jib-logs` CLIs talk to.

use anyhow::Context as _;
use clap::{Parser, Subcommand};
use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use tokio::sync::RwLock;

#[derive(Parser)]
#[command(name = "jib-hostd", version)]
#[command(about = "jib host daemon: gateway, chat bridge, dispatcher, container lifecycle")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,

    /// Override the instance directory (defaults to `JIB_HOME` or the platform data dir).
    #[arg(long, global = true)]
    instance_dir: Option<std::path::PathBuf>,

    #[arg(short, long, global = true)]
    debug: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Start the daemon (default when no subcommand is given).
    Start {
        #[arg(short, long)]
        foreground: bool,
    },
    Stop,
    Restart {
        #[arg(short, long)]
        foreground: bool,
    },
    Status,
}

fn main() -> anyhow::Result<()> {
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("failed to install rustls crypto provider"))?;

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Start { foreground: false });

    match command {
        Command::Start { foreground } => cmd_start(cli.instance_dir, cli.debug, foreground),
        Command::Stop => cmd_stop(cli.instance_dir),
        Command::Restart { foreground } => {
            cmd_stop_if_running(cli.instance_dir.clone());
            cmd_start(cli.instance_dir, cli.debug, foreground)
        }
        Command::Status => cmd_status(cli.instance_dir),
    }
}

fn resolve_instance_dir(instance_dir: Option<std::path::PathBuf>) -> std::path::PathBuf {
    instance_dir.unwrap_or_else(jib::config::Config::default_instance_dir)
}

fn cmd_start(
    instance_dir: Option<std::path::PathBuf>,
    debug: bool,
    foreground: bool,
) -> anyhow::Result<()> {
    let instance_dir = resolve_instance_dir(instance_dir);
    let paths = jib::daemon::DaemonPaths::new(&instance_dir);

    if let Some(pid) = jib::daemon::is_running(&paths) {
        eprintln!("jib-hostd is already running (pid {pid})");
        std::process::exit(1);
    }

    // Validate config loads before forking, same as the secrets/policy files:
    // a broken instance directory should fail loudly here, not inside a
    // daemonized child with no controlling terminal.
    let config = jib::config::Config::load_from(&instance_dir).context("failed to load configuration")?;

    if !foreground {
        // Daemonize before any Tokio runtime exists — Tokio's I/O driver and
        // thread pool don't survive fork, so tracing init (and the OTLP batch
        // exporter it may create) must happen after this call, inside the
        // fresh runtime built below.
        jib::daemon::daemonize(&paths)?;
    }

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    runtime.block_on(async {
        let otel_provider = if foreground {
            jib::daemon::init_foreground_tracing(debug, &config.telemetry)
        } else {
            jib::daemon::init_background_tracing(&paths, debug, &config.telemetry)
        };

        let result = run(config, foreground).await;

        if let Some(provider) = otel_provider {
            use opentelemetry::trace::TracerProvider as _;
            let _ = provider.tracer("jib-hostd");
            if let Err(error) = provider.shutdown() {
                tracing::warn!(%error, "failed to flush OTLP tracer provider on shutdown");
            }
        }

        result
    })
}

#[tokio::main]
async fn cmd_stop(instance_dir: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let instance_dir = resolve_instance_dir(instance_dir);
    let paths = jib::daemon::DaemonPaths::new(&instance_dir);

    let Some(pid) = jib::daemon::is_running(&paths) else {
        eprintln!("jib-hostd is not running");
        std::process::exit(1);
    };

    match jib::daemon::send_command(&paths, jib::daemon::IpcCommand::Shutdown).await {
        Ok(jib::daemon::IpcResponse::Ok) => eprintln!("stopping jib-hostd (pid {pid})..."),
        Ok(jib::daemon::IpcResponse::Error { message }) => {
            eprintln!("shutdown failed: {message}");
            std::process::exit(1);
        }
        Ok(_) => {
            eprintln!("unexpected response from daemon");
            std::process::exit(1);
        }
        Err(error) => {
            eprintln!("failed to send shutdown command: {error}");
            std::process::exit(1);
        }
    }

    if jib::daemon::wait_for_exit(pid) {
        eprintln!("jib-hostd stopped");
    } else {
        eprintln!("jib-hostd did not stop within 10 seconds (pid {pid})");
        std::process::exit(1);
    }

    Ok(())
}

fn cmd_stop_if_running(instance_dir: Option<std::path::PathBuf>) {
    let instance_dir = resolve_instance_dir(instance_dir);
    let paths = jib::daemon::DaemonPaths::new(&instance_dir);

    let Some(pid) = jib::daemon::is_running(&paths) else {
        return;
    };

    let Ok(runtime) = tokio::runtime::Builder::new_current_thread().enable_all().build() else {
        return;
    };

    runtime.block_on(async {
        if let Ok(jib::daemon::IpcResponse::Ok) =
            jib::daemon::send_command(&paths, jib::daemon::IpcCommand::Shutdown).await
        {
            eprintln!("stopping jib-hostd (pid {pid})...");
            jib::daemon::wait_for_exit(pid);
        }
    });
}

fn cmd_status(instance_dir: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let instance_dir = resolve_instance_dir(instance_dir);
    let paths = jib::daemon::DaemonPaths::new(&instance_dir);

    let Some(_pid) = jib::daemon::is_running(&paths) else {
        eprintln!("jib-hostd is not running");
        std::process::exit(1);
    };

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build Tokio runtime")?;

    runtime.block_on(async {
        match jib::daemon::send_command(&paths, jib::daemon::IpcCommand::Status).await {
            Ok(jib::daemon::IpcResponse::Status { pid, uptime_seconds }) => {
                let hours = uptime_seconds / 3600;
                let minutes = (uptime_seconds % 3600) / 60;
                let seconds = uptime_seconds % 60;
                eprintln!("jib-hostd is running");
                eprintln!("  pid:    {pid}");
                eprintln!("  uptime: {hours}h {minutes}m {seconds}s");
            }
            Ok(jib::daemon::IpcResponse::Error { message }) => {
                eprintln!("status query failed: {message}");
                std::process::exit(1);
            }
            Ok(_) => {
                eprintln!("unexpected response from daemon");
                std::process::exit(1);
            }
            Err(error) => {
                eprintln!("failed to query daemon status: {error}");
                std::process::exit(1);
            }
        }
    });

    Ok(())
}

async fn run(config: jib::config::Config, foreground: bool) -> anyhow::Result<()> {
    tracing::info!("starting jib-hostd");
    tracing::info!(instance_dir = %config.instance_dir.display(), "configuration loaded");

    let config = Arc::new(config);
    let secrets =
        Arc::new(jib::secrets::SecretsStore::load(&config.secrets_path()).context("failed to load secret bundle")?);
    let policy =
        Arc::new(jib::policy::PolicyStore::load(&config.repositories_path()).context("failed to load repository policy")?);

    let sqlite_pool = jib::db::connect(&config.sqlite_path()).await.context("failed to open sqlite database")?;
    let tasks = Arc::new(jib::tasks::store::TaskStore::new(sqlite_pool.clone()));
    let (event_tx, _event_rx) = tokio::sync::broadcast::channel(256);

    let deps = jib::HostDeps {
        config: config.clone(),
        secrets: secrets.clone(),
        policy: policy.clone(),
        tasks,
        sqlite_pool,
        event_tx,
    };

    // Shared across GatewayState and ContainerManager so a session started
    // via IPC is immediately visible to the gateway's own handlers (spec
    // §4.1, §4.3).
    let worktrees = Arc::new(RwLock::new(jib::gateway::worktree::WorktreeIndex::default()));
    let active_containers: Arc<RwLock<HashSet<jib::ContainerId>>> = Arc::new(RwLock::new(HashSet::new()));
    let private_mode = Arc::new(AtomicBool::new(false));

    let correlation = Arc::new(
        jib::container::CorrelationIndex::load(&config.container_logs_dir())
            .context("failed to load run-correlation index")?,
    );
    let containers = Arc::new(
        jib::container::ContainerManager::new(
            config.clone(),
            worktrees.clone(),
            active_containers.clone(),
            correlation,
            private_mode.clone(),
        )
        .context("failed to initialize container lifecycle manager")?,
    );

    // Crash recovery: a worktree whose container died without cleanup is
    // orphaned and must be swept before anything else touches it (spec §4.2).
    match containers.sweep_orphans().await {
        Ok(swept) if !swept.is_empty() => tracing::info!(count = swept.len(), "swept orphaned worktrees at startup"),
        Ok(_) => {}
        Err(error) => tracing::warn!(%error, "orphan worktree sweep failed at startup"),
    }

    let gateway_state = Arc::new(
        jib::gateway::state::GatewayState::new(deps.clone(), &config, worktrees, active_containers, private_mode)
            .context("failed to build gateway state")?,
    );

    let bot_token = secrets
        .current()
        .chat_bot_token
        .clone()
        .context("CHAT_BOT_TOKEN is required but not configured")?;
    let chat_proxy = Arc::new(
        jib::gateway::chat_proxy::ChatProxy::new(
            bot_token.clone(),
            gateway_state.chat_pacer.clone(),
            gateway_state.reqlog.clone(),
        )
        .context("failed to initialize chat proxy")?,
    );

    let app_state = jib::gateway::server::AppState { gateway: gateway_state.clone(), chat: chat_proxy.clone() };
    let router = jib::gateway::server::build_router(app_state);
    let bind = config.gateway.bind;
    tokio::spawn(async move {
        if let Err(error) = jib::gateway::server::serve(bind, router).await {
            tracing::error!(%error, "gateway HTTP server exited");
        }
    });

    let app_token = secrets
        .current()
        .chat_socket_token
        .clone()
        .context("CHAT_SOCKET_TOKEN is required but not configured")?;
    let thread_index = Arc::new(
        jib::chat::thread_index::ThreadIndex::load(&config.tracking_dir()).context("failed to load thread index")?,
    );

    let inbound = Arc::new(jib::chat::inbound::InboundListener::new(
        bot_token,
        app_token,
        config.clone(),
        chat_proxy.clone(),
        thread_index.clone(),
        deps.clone(),
    ));
    inbound.start().await.context("failed to start chat inbound listener")?;

    let outbound = Arc::new(jib::chat::outbound::NotificationWatcher::new(
        config.notifications_dir(),
        chat_proxy,
        thread_index,
        deps.clone(),
        std::time::Duration::from_secs(config.chat.batch_window_secs),
    ));
    let _notification_watcher_handle = outbound.spawn().context("failed to start outbound notification watcher")?;

    let dispatcher = jib::dispatcher::Dispatcher::new(deps.clone(), containers.clone());
    let _dispatcher_watcher_handle = dispatcher.spawn().context("failed to start dispatcher trigger sources")?;

    let daemon_paths = jib::daemon::DaemonPaths::new(&config.instance_dir);
    let (mut shutdown_rx, _ipc_handle) = jib::daemon::start_ipc_server(&daemon_paths, deps, containers)
        .await
        .context("failed to start IPC server")?;

    if foreground {
        eprintln!("jib-hostd running in foreground (pid {})", std::process::id());
    } else {
        tracing::info!(pid = std::process::id(), "jib-hostd daemon started");
    }

    shutdown_rx.changed().await.ok();
    tracing::info!("jib-hostd shutting down");
    Ok(())
}
