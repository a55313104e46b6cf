use crate::config::{GatewayConfig, LoggerConfig};
use crate::metrics::Metrics;
use crate::routing::RouteTable;
use crate::{rules, server, tripper};
use anyhow::Result;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;

/// CLI arguments forwarded from `main()`.
pub struct BootstrapArgs {
    pub config_path: PathBuf,
    pub logger_config_path: Option<PathBuf>,
}

/// Gateway lifecycle: init logging → load config → compile rules →
/// serve → wait for a signal → drain → exit.
pub async fn run(args: BootstrapArgs) -> Result<()> {
    let logger_config = LoggerConfig::load(args.logger_config_path.as_deref())?;
    init_tracing(&logger_config)?;

    let config = Arc::new(GatewayConfig::load(&args.config_path)?);
    let metrics = Metrics::install(&config.prometheus.namespace);
    let variables = Arc::new(config.variables.clone());

    let compiled = rules::compile(&config, &variables).await?;
    let table = Arc::new(RouteTable::new(compiled));
    let transport = tripper::build_transport(&config.network.upstream)?;

    let state = server::GatewayState {
        config: config.clone(),
        variables,
        table,
        transport,
        metrics,
    };

    let shutdown = Arc::new(Notify::new());

    if config.prometheus.port != 0 {
        let metrics_state = state.clone();
        tokio::spawn(async move {
            if let Err(e) = server::run_metrics_server(metrics_state).await {
                tracing::error!("server: metrics failed, error={}", e);
            }
        });
    }

    tracing::info!(
        "server: starting gateway, port={}",
        config.network.downstream.port
    );
    let proxy_handle = tokio::spawn({
        let state = state.clone();
        let shutdown = shutdown.clone();
        async move { server::run_proxy_server(state, shutdown).await }
    });

    wait_for_shutdown(&shutdown).await;

    // The proxy task drains in-flight connections within its grace window.
    match proxy_handle.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => tracing::error!("server: proxy error: {}", e),
        Err(e) => tracing::error!("server: proxy task error: {}", e),
    }

    tracing::info!("server: shutdown complete");
    Ok(())
}

fn init_tracing(config: &LoggerConfig) -> Result<()> {
    let writer: Box<dyn std::io::Write + Send> = if config.path.is_empty() {
        Box::new(std::io::stdout())
    } else {
        Box::new(
            std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&config.path)?,
        )
    };
    let (non_blocking, guard) = tracing_appender::non_blocking::NonBlockingBuilder::default()
        .buffered_lines_limit(128_000)
        .lossy(true)
        .finish(writer);

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(config.level.clone()));

    if config.format.eq_ignore_ascii_case("json") {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .json(),
            )
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(
                tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false),
            )
            .init();
    }

    // The writer guard must live for the process lifetime.
    std::mem::forget(guard);
    Ok(())
}

/// Block until a termination signal arrives, then wake every shutdown
/// listener. SIGHUP is a shutdown too — there is no live reload.
async fn wait_for_shutdown(shutdown: &Arc<Notify>) {
    let ctrl_c = tokio::signal::ctrl_c();

    #[cfg(unix)]
    let terminate = wait_for_unix_signals();

    #[cfg(not(unix))]
    let terminate = std::future::pending::<&str>();

    tokio::select! {
        _ = ctrl_c => tracing::info!("server: received SIGINT, shutting down"),
        name = terminate => tracing::info!("server: received {}, shutting down", name),
    }

    shutdown.notify_waiters();
}

#[cfg(unix)]
async fn wait_for_unix_signals() -> &'static str {
    use tokio::signal::unix::{signal, SignalKind};
    let mut term = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut quit = signal(SignalKind::quit()).expect("failed to install SIGQUIT handler");

    tokio::select! {
        _ = term.recv() => "SIGTERM",
        _ = hangup.recv() => "SIGHUP",
        _ = quit.recv() => "SIGQUIT",
    }
}
