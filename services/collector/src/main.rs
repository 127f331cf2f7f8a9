use chrono::Utc;
use clap::{Arg, ArgAction, Command};
use collector::alarm::AlarmNotifier;
use collector::config::{DEFAULT_CONFIG_PATH, load_config_from_path};
use collector::dispatcher::{Dispatcher, TickOutcome};
use collector::ndac::NdacClient;
use collector::session::SessionManager;
use collector::status_http::{AppState, build_router};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "collector starting");

    let matches = Command::new("NDAC telemetry collector")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Incrementally collects PM/FM telemetry from the NDAC API")
        .arg(
            Arg::new("config")
                .help("Path to the collector TOML config")
                .short('c')
                .long("config")
                .value_name("path")
                .default_value(DEFAULT_CONFIG_PATH),
        )
        .arg(
            Arg::new("once")
                .help("Run one tick for every polling unit, log out and exit")
                .long("once")
                .action(ArgAction::SetTrue),
        )
        .get_matches();

    let config_path = PathBuf::from(
        matches
            .get_one::<String>("config")
            .map_or(DEFAULT_CONFIG_PATH, String::as_str),
    );
    let once = matches.get_flag("once");

    let cfg = match load_config_from_path(&config_path) {
        Ok(cfg) => {
            info!(
                base_url = %cfg.ndac.base_url,
                users = cfg.users.len(),
                apis = cfg.apis.len(),
                "config loaded"
            );
            cfg
        }
        Err(e) => {
            eprintln!("FATAL: failed to load config: {e}");
            std::process::exit(1);
        }
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let client = match NdacClient::new(cfg.ndac.clone()) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("FATAL: failed to build NDAC client: {e}");
            std::process::exit(1);
        }
    };

    let notifier = match &cfg.alarms {
        Some(alarms) => match AlarmNotifier::new(&alarms.config_path) {
            Ok(n) => {
                info!(path = %alarms.config_path.display(), "alarm notifier enabled");
                Some(Arc::new(n))
            }
            Err(e) => {
                eprintln!("FATAL: failed to set up alarm notifier: {e}");
                std::process::exit(1);
            }
        },
        None => None,
    };

    // -------------------------------------------------------------------------
    // Sessions
    // -------------------------------------------------------------------------
    let sessions = Arc::new(SessionManager::new(client, &cfg, shutdown_rx));
    let alive = sessions.authenticate_all().await;
    if alive == 0 {
        eprintln!("FATAL: no configured user could be authenticated");
        std::process::exit(1);
    }
    info!(alive, users = cfg.users.len(), "initial authentication pass complete");

    // -------------------------------------------------------------------------
    // Dispatcher
    // -------------------------------------------------------------------------
    let dispatcher = match Dispatcher::new(&cfg, Arc::clone(&sessions), notifier) {
        Ok(d) => Arc::new(d),
        Err(e) => {
            eprintln!("FATAL: failed to open checkpoint store: {e}");
            std::process::exit(1);
        }
    };
    dispatcher.schedule_all().await;

    if once {
        let outcomes = dispatcher.run_once(Utc::now()).await;
        let fetched = outcomes
            .iter()
            .filter(|(_, o)| matches!(o, TickOutcome::Fetched { .. }))
            .count();
        info!(units = outcomes.len(), fetched, "single pass complete");
        shutdown_tx.send(true).ok();
        sessions.logout_all().await;
        return;
    }

    // -------------------------------------------------------------------------
    // Status HTTP
    // -------------------------------------------------------------------------
    if let Some(http) = &cfg.status_http {
        let listener = tokio::net::TcpListener::bind(&http.bind)
            .await
            .unwrap_or_else(|e| {
                eprintln!("FATAL: failed to bind status HTTP on {}: {e}", http.bind);
                std::process::exit(1);
            });
        info!(bind = %http.bind, "status HTTP server started");
        let router = build_router(Arc::new(AppState {
            dispatcher: Arc::clone(&dispatcher),
        }));
        tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, router).await {
                error!(error = %e, "status HTTP server exited");
            }
        });
    }

    dispatcher.start().await;

    wait_for_shutdown_signal().await;

    shutdown_tx.send(true).ok();
    dispatcher.stop().await;
    sessions.logout_all().await;

    info!("collector shutdown complete");
}

async fn wait_for_shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};
        let mut sigterm = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                error!("failed to install SIGTERM handler: {}", e);
                tokio::signal::ctrl_c().await.ok();
                return;
            }
        };
        tokio::select! {
            _ = tokio::signal::ctrl_c() => info!("shutdown: SIGINT received"),
            _ = sigterm.recv() => info!("shutdown: SIGTERM received"),
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await.ok();
        info!("shutdown: Ctrl-C received");
    }
}
