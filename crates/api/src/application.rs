use std::sync::Arc;

use actix_web::{middleware::Logger, web, App, HttpServer};
use thiserror::Error;
use tokio::net::TcpListener;
use tracing::info;

use ledger_watch_domain::{
    config::{ConfigError, SourceMode, WatchConfig},
    services::telemetry::{init_telemetry, TelemetryConfig, TelemetryError},
};
use ledger_watch_monitor::{
    EthJsonRpcClient, EventSource, PollEventSource, PushEventSource, WatchHub,
};

use crate::{
    handlers::{health_handler, list_sessions_handler, metrics_handler, session_handler},
    state::AppState,
    ws,
};

pub async fn run() -> Result<(), BootstrapError> {
    let config = WatchConfig::load_from_env()?;
    let telemetry = init_telemetry(&TelemetryConfig::from_env("WATCH"))?;

    let settings = config.session();
    let client = Arc::new(EthJsonRpcClient::from_config(&config));
    let source: Arc<dyn EventSource> = match config.source_mode() {
        SourceMode::Push => Arc::new(PushEventSource::new(client, settings)),
        SourceMode::Poll => Arc::new(PollEventSource::new(client, settings)),
    };
    let hub = WatchHub::new(source, settings);

    let listener = TcpListener::bind(config.watch_bind_address()).await?;
    info!(
        address = config.watch_bind_address(),
        mode = %config.source_mode(),
        ledger = config.ledger_http_url(),
        "watch socket listening"
    );

    let state = AppState::new(hub.clone(), telemetry);
    let server = HttpServer::new(move || {
        App::new()
            .app_data(web::Data::new(state.clone()))
            .wrap(Logger::default())
            .configure(routes)
    })
    .bind(config.api_bind_address())?
    .run();
    info!(address = config.api_bind_address(), "http api listening");

    let outcome = tokio::select! {
        served = server => served.map_err(BootstrapError::from),
        _ = ws::serve(listener, hub.clone()) => Ok(()),
    };

    hub.shutdown().await;
    outcome
}

pub fn routes(cfg: &mut web::ServiceConfig) {
    cfg.route("/healthz", web::get().to(health_handler))
        .route("/metrics", web::get().to(metrics_handler))
        .route("/api/v1/sessions", web::get().to(list_sessions_handler))
        .route("/api/v1/sessions/{id}", web::get().to(session_handler));
}

#[derive(Debug, Error)]
pub enum BootstrapError {
    #[error("config error: {0}")]
    Config(#[from] ConfigError),
    #[error("telemetry error: {0}")]
    Telemetry(#[from] TelemetryError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}
