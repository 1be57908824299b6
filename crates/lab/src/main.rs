use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info, warn, LevelFilter};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use lab::api::{create_router, AppState};
use lab::browser::{
    BrowserOrchestrator, BrowserOrchestratorConfig, BrowserStateRepository, HttpDaemonController,
};
use lab::bus::ChannelBus;
use lab::config::LabConfig;
use lab::db::Database;
use lab::events::AgentEventRepository;
use lab::github::GithubSettingsRepository;
use lab::logs::LogRegistry;
use lab::orchestrate::{OrchestrationRepository, OrchestrationService};
use lab::ports::{PortAllocator, PortReservationRepository};
use lab::project::ProjectRepository;
use lab::proxy::{proxy_router, ProxyState, RouteTable};
use lab::sandbox::CliSandbox;
use lab::session::{ContainerEventMonitor, SessionRepository, SessionService};
use lab::typing::TypingRegistry;

const APP_NAME: &str = "lab";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Lab - background-agent platform server.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Override the config file path
    #[arg(long, value_name = "PATH", global = true)]
    config: Option<PathBuf>,
    /// Reduce output to only errors
    #[arg(short, long, action = clap::ArgAction::SetTrue, global = true)]
    quiet: bool,
    /// Increase logging verbosity (stackable)
    #[arg(short = 'v', long = "verbose", action = clap::ArgAction::Count, global = true)]
    verbose: u8,
    /// Enable debug logging (equivalent to -vv)
    #[arg(long, global = true)]
    debug: bool,
    /// Enable trace logging (overrides other levels)
    #[arg(long, global = true)]
    trace: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the API and proxy listeners (default).
    Serve,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(&cli.common);

    let config = LabConfig::load(cli.common.config.as_deref())?;

    match cli.command.unwrap_or(Command::Serve) {
        Command::Serve => serve(config),
    }
}

fn effective_log_level(opts: &CommonOpts) -> LevelFilter {
    if opts.trace {
        LevelFilter::Trace
    } else if opts.debug {
        LevelFilter::Debug
    } else {
        match opts.verbose {
            0 => LevelFilter::Info,
            1 => LevelFilter::Debug,
            _ => LevelFilter::Trace,
        }
    }
}

fn init_logging(opts: &CommonOpts) {
    use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    if opts.quiet {
        log::set_max_level(LevelFilter::Off);
        return;
    }

    let level = match effective_log_level(opts) {
        LevelFilter::Off => "off",
        LevelFilter::Error => "error",
        LevelFilter::Warn => "warn",
        LevelFilter::Info => "info",
        LevelFilter::Debug => "debug",
        LevelFilter::Trace => "trace",
    };

    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={level},tower_http={level}")));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .try_init()
        .ok();

    // Also init env_logger for compatibility with log crate users.
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(effective_log_level(opts));
    builder.try_init().ok();
}

#[tokio::main]
async fn serve(config: LabConfig) -> Result<()> {
    let config = Arc::new(config);
    info!(
        "Starting {} (api :{}, proxy :{}, base domain {})",
        APP_NAME, config.api_port, config.proxy_port, config.proxy_base_domain
    );

    let db = Database::new(&config.database_url).await?;

    // Sandbox provider. A dead endpoint is logged, not fatal; the monitor
    // reconnects once it comes back.
    let provider = Arc::new(CliSandbox::new(config.sandbox_endpoint.clone()));
    match provider.health_check().await {
        Ok(_) => info!("Sandbox provider reachable"),
        Err(e) => warn!("Sandbox provider not reachable yet: {}", e),
    }

    // Shared infrastructure.
    let bus = Arc::new(ChannelBus::new());
    let routes = Arc::new(RouteTable::new(config.proxy_base_domain.clone()));
    let logs = Arc::new(LogRegistry::new());
    let typing = Arc::new(TypingRegistry::new());

    // Port allocator, rehydrated from persisted reservations.
    let (port_lo, port_hi) = config.stream_port_bounds()?;
    let reservations = PortReservationRepository::new(db.pool().clone());
    let ports = Arc::new(PortAllocator::new(port_lo, port_hi, reservations.clone()));
    let rehydrated = ports
        .rehydrate()
        .await
        .context("rehydrating port allocator")?;
    if rehydrated > 0 {
        info!("Rehydrated {} port reservation(s)", rehydrated);
    }

    // Browser orchestrator.
    let controller = Arc::new(HttpDaemonController::new(config.browser_api_url.clone()));
    if lab::browser::DaemonController::is_healthy(controller.as_ref()).await {
        info!("Browser daemon API reachable at {}", config.browser_api_url);
    } else {
        warn!(
            "Browser daemon API not reachable at {}; sessions will retry on demand",
            config.browser_api_url
        );
    }
    let browser = BrowserOrchestrator::new(
        BrowserStateRepository::new(db.pool().clone()),
        reservations,
        controller,
        ports,
        bus.clone(),
        BrowserOrchestratorConfig {
            reconcile_interval: config.reconcile_interval(),
            cleanup_delay: config.browser_cleanup_delay(),
            max_retries: config.max_daemon_retries as i64,
        },
    );

    // Session orchestrator.
    let projects = ProjectRepository::new(db.pool().clone());
    let events = AgentEventRepository::new(db.pool().clone());
    let sessions = SessionService::new(
        SessionRepository::new(db.pool().clone()),
        projects.clone(),
        provider.clone(),
        routes.clone(),
        bus.clone(),
        browser.clone(),
        logs.clone(),
        events.clone(),
        config.shared_volumes.clone(),
    );

    let orchestrations = OrchestrationService::new(
        OrchestrationRepository::new(db.pool().clone()),
        projects.clone(),
        sessions.clone(),
        events.clone(),
        bus.clone(),
    );

    let state = AppState {
        config: config.clone(),
        db: db.clone(),
        projects: projects.clone(),
        sessions: sessions.clone(),
        browser: browser.clone(),
        orchestrations,
        events,
        github: GithubSettingsRepository::new(db.pool().clone()),
        bus: bus.clone(),
        routes: routes.clone(),
        typing,
        logs: logs.clone(),
    };

    // Re-drive whatever a crash left mid-flight, then warm the pools.
    sessions.recovery_sweep().await;
    for project in projects.list_pooled().await? {
        let sessions = sessions.clone();
        tokio::spawn(async move {
            sessions.ensure_pool(&project.id).await;
        });
    }

    let token = CancellationToken::new();

    // Container event monitor.
    let monitor = ContainerEventMonitor::new(
        provider.clone(),
        SessionRepository::new(db.pool().clone()),
        bus.clone(),
        logs.clone(),
    );
    tokio::spawn(monitor.run(token.clone()));

    // Browser reconcile loop plus its error listener.
    tokio::spawn(browser.clone().run(token.clone()));
    let mut browser_errors = browser.subscribe_errors();
    tokio::spawn(async move {
        while let Ok(failures) = browser_errors.recv().await {
            for failure in failures {
                error!(
                    "Browser reconcile failure for session {}: {}",
                    failure.session_id, failure.message
                );
            }
        }
    });

    // API listener.
    let api_addr = SocketAddr::from(([0, 0, 0, 0], config.api_port));
    let api_listener = TcpListener::bind(api_addr)
        .await
        .with_context(|| format!("binding API listener on {}", api_addr))?;
    info!("API listening on {}", api_addr);

    // Proxy listener.
    let proxy_addr = SocketAddr::from(([0, 0, 0, 0], config.proxy_port));
    let proxy_listener = TcpListener::bind(proxy_addr)
        .await
        .with_context(|| format!("binding proxy listener on {}", proxy_addr))?;
    info!("Subdomain proxy listening on {}", proxy_addr);

    let proxy_state = ProxyState::new(
        routes,
        config.proxy_base_domain.clone(),
        config.proxy_idle_timeout(),
    );

    let api_token = token.clone();
    let api_server = axum::serve(
        api_listener,
        create_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { api_token.cancelled().await });

    let proxy_token = token.clone();
    let proxy_server = axum::serve(
        proxy_listener,
        proxy_router(proxy_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { proxy_token.cancelled().await });

    let shutdown_token = token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown requested");
            shutdown_token.cancel();
        }
    });

    let (api_result, proxy_result) = tokio::join!(api_server, proxy_server);
    api_result.context("API server failed")?;
    proxy_result.context("proxy server failed")?;

    info!("Shutdown complete");
    Ok(())
}
