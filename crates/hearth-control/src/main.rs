use std::{path::Path, sync::Arc};

use anyhow::Context;
use hearth_agent::{GameConfig, config::format_error_chain, console_io::CONSOLE_LOG_TARGET};
use hearth_control::{
    AppState, app, auth::JwtTokenService, config::ControlConfig, session_sweeper::SessionSweeper,
};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{EnvFilter, Layer, filter::Targets, layer::SubscriberExt, util::SubscriberInitExt};

/// Operator logs go to stderr; raw game console lines additionally go to a
/// daily rolling `console.log` under `log_dir`.
fn init_tracing(log_dir: &Path) -> WorkerGuard {
    let file = tracing_appender::rolling::daily(log_dir, "console.log");
    let (console_writer, guard) = tracing_appender::non_blocking(file);

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer().with_filter(
                EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
            ),
        )
        .with(
            tracing_subscriber::fmt::layer()
                .with_writer(console_writer)
                .with_ansi(false)
                .with_target(false)
                .with_filter(Targets::new().with_target(CONSOLE_LOG_TARGET, tracing::Level::INFO)),
        )
        .init();
    guard
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown requested");
}

async fn run() -> anyhow::Result<()> {
    let control = ControlConfig::from_env().context("control configuration")?;
    let _guard = init_tracing(&control.console_log_dir);
    if control.uses_default_secret() {
        tracing::warn!("HEARTH_JWT_SECRET is not set; using an insecure development secret");
    }
    let game = GameConfig::from_env().context("game configuration")?;

    let tokens = Arc::new(JwtTokenService::new(
        &control.jwt_secret,
        control.jwt_issuer.clone(),
        control.jwt_audience.clone(),
    ));
    let state = AppState::build(game, tokens, control.allowed_origins.clone());
    let sweeper = SessionSweeper::new(state.sessions.clone(), control.session_sweep_interval).spawn();

    let listener = tokio::net::TcpListener::bind(control.bind)
        .await
        .with_context(|| format!("bind {}", control.bind))?;
    tracing::info!(addr = %control.bind, "hearth-control HTTP listening");

    axum::serve(listener, app(state.clone()))
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    sweeper.abort();
    let timeout = state.supervisor.config().stop_timeout;
    if !state.supervisor.stop_forcibly(timeout).await {
        tracing::error!("game process still running at shutdown");
    }
    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        tracing::error!(error = %format_error_chain(&e), "hearth-control failed");
        eprintln!("hearth-control: {}", format_error_chain(&e));
        std::process::exit(1);
    }
}
