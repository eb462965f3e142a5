use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tapcast_relay::{
    build_router,
    config::{LogFormat, RelayConfig, MIN_SECRET_LEN},
    profile::ProfileCache,
    registry::SessionRegistry,
    upstream::{WebcastConfig, WebcastSource},
    AppState,
};
use tokio::net::TcpListener;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RelayConfig::from_env().context("invalid relay configuration")?;
    init_tracing(&config);

    if config.is_dev_ws_secret() {
        warn!("TAPCAST_WS_SECRET is not set; using the development subscriber secret");
    } else if config.ws_secret.len() < MIN_SECRET_LEN {
        warn!(min_len = MIN_SECRET_LEN, "TAPCAST_WS_SECRET is shorter than recommended");
    }
    if config.is_dev_admin_secret() {
        warn!("TAPCAST_ADMIN_SECRET is not set; using the development operator secret");
    }
    if config.tenants.is_empty() {
        warn!("no tenants configured; register them through POST /v1/tenants");
    }

    let profiles = Arc::new(ProfileCache::new(config.profile_ttl));
    let sweep_interval = (config.profile_ttl / 4).max(Duration::from_secs(1));
    let sweeper = ProfileCache::spawn_sweeper(Arc::clone(&profiles), sweep_interval);

    let source = Arc::new(WebcastSource::new(WebcastConfig::new(config.upstream_base_url.clone())));
    let registry = Arc::new(SessionRegistry::new(
        source,
        config.supervisor_settings(),
        profiles,
        config.ws_secret.clone(),
    ));
    for tenant in config.tenants.iter().cloned() {
        let key = tenant.key.redacted();
        if let Err(error) = registry.register_tenant(tenant).await {
            error!(tenant = %key, error = %error, "failed to register configured tenant");
        }
    }

    let app = build_router(AppState::new(Arc::clone(&registry), &config.admin_secret));
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind relay listener on {}", config.listen_addr))?;

    info!(
        listen_addr = %config.listen_addr,
        tenants = config.tenants.len(),
        proxy = config.proxy_url.is_some(),
        "starting tapcast relay"
    );

    // Sessions are stopped as soon as the signal arrives: their close
    // frames end the upgraded sockets the server would otherwise wait on.
    let shutdown_registry = Arc::clone(&registry);
    let served = axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            shutdown_registry.shutdown().await;
        })
        .await
        .context("relay server exited unexpectedly");

    sweeper.abort();
    served
}

fn init_tracing(config: &RelayConfig) {
    let filter = tracing_subscriber::EnvFilter::try_new(&config.log_filter)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c().await.expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("shutdown signal received");
}
