//! Meeting Controller
//!
//! The classroom control plane binary. Serves the realtime WebSocket
//! gateway (admission, presence, moderation, hand-raise, chat, and SFU
//! token minting) on `gateway_bind_address`, and health/admin HTTP
//! endpoints on `health_bind_address`.

use common::secret::{ExposeSecret, SecretBox};
use meeting_controller::actors::controller::spawn_registry;
use meeting_controller::config::Config;
use meeting_controller::gateway::{gateway_router, GatewayState};
use meeting_controller::identity::IdentityResolver;
use meeting_controller::jwks::JwksClient;
use meeting_controller::observability::admin::admin_router;
use meeting_controller::observability::health::{health_router, HealthState};
use meeting_controller::observability::metrics::{
    init_metrics_recorder, metrics_router, spawn_stats_poller,
};
use meeting_controller::sfu_token::SfuTokenService;
use meeting_controller::store::{PostgresStore, Store};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meeting_controller=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("starting meeting controller");

    let metrics_handle = init_metrics_recorder().map_err(|e| {
        error!("failed to initialize metrics recorder: {e}");
        e
    })?;

    let config = Config::from_env().map_err(|e| {
        error!("failed to load configuration: {e}");
        e
    })?;

    info!(
        instance_id = %config.instance_id,
        gateway_bind_address = %config.gateway_bind_address,
        health_bind_address = %config.health_bind_address,
        "configuration loaded"
    );

    let health_state = Arc::new(HealthState::new());

    info!("connecting to database");
    let db_pool = sqlx::postgres::PgPoolOptions::new()
        .max_connections(config.database_max_connections)
        .acquire_timeout(Duration::from_secs(5))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(config.database_url.expose_secret())
        .await
        .map_err(|e| {
            error!("failed to connect to database: {e}");
            e
        })?;
    sqlx::migrate!("./migrations").run(&db_pool).await.map_err(|e| {
        error!("failed to run database migrations: {e}");
        e
    })?;
    info!("database connection established");

    let store: Arc<dyn Store> = Arc::new(PostgresStore::new(db_pool));

    let controller = spawn_registry(store, &config).await;
    info!("registry actor started, resumed non-ended meetings");

    spawn_stats_poller(controller.clone(), Duration::from_secs(15));

    let jwks_client = Arc::new(JwksClient::new(config.identity_jwks_url.clone()));
    let initial_keys = jwks_client.get_or_refresh().await.map_err(|e| {
        error!("failed to fetch initial jwks key set: {e}");
        e
    })?;
    let identity = Arc::new(RwLock::new(IdentityResolver::new(initial_keys)));
    spawn_jwks_refresh_task(
        jwks_client,
        Arc::clone(&identity),
        config.identity_keys_refresh_seconds,
    );

    let signing_secret = hex::decode(config.signing_secret.expose_secret().trim())
        .unwrap_or_else(|_| config.signing_secret.expose_secret().as_bytes().to_vec());
    let sfu_tokens = Arc::new(SfuTokenService::new(
        SecretBox::new(Box::new(signing_secret)),
        config.sfu_token_ttl_seconds,
    ));

    let gateway_state = GatewayState::new(controller.clone(), identity, sfu_tokens);

    let cors = if config.allowed_origins.is_empty() {
        CorsLayer::permissive()
    } else {
        let origins: Vec<axum::http::HeaderValue> = config
            .allowed_origins
            .iter()
            .filter_map(|o| o.parse().ok())
            .collect();
        CorsLayer::new().allow_origin(origins)
    };

    let gateway_app = gateway_router(gateway_state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let internal_app = health_router(Arc::clone(&health_state))
        .merge(admin_router(controller))
        .merge(metrics_router(metrics_handle));

    let gateway_addr: SocketAddr = config.gateway_bind_address.parse().map_err(|e| {
        error!("invalid gateway bind address: {e}");
        e
    })?;
    let health_addr: SocketAddr = config.health_bind_address.parse().map_err(|e| {
        error!("invalid health bind address: {e}");
        e
    })?;

    let gateway_listener = tokio::net::TcpListener::bind(gateway_addr).await?;
    let health_listener = tokio::net::TcpListener::bind(health_addr).await?;

    info!(addr = %gateway_addr, "gateway listening");
    info!(addr = %health_addr, "health/admin listening");

    health_state.set_ready();

    let gateway_server = axum::serve(gateway_listener, gateway_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());
    let health_server = axum::serve(health_listener, internal_app.into_make_service())
        .with_graceful_shutdown(shutdown_signal());

    let (gateway_result, health_result) = tokio::join!(gateway_server, health_server);
    gateway_result?;
    health_result?;

    info!("meeting controller shutdown complete");
    Ok(())
}

/// Periodically refreshes the Identity Provider's cached key set so a key
/// rotation is picked up without a restart (§4 component 1).
fn spawn_jwks_refresh_task(
    client: Arc<JwksClient>,
    identity: Arc<RwLock<IdentityResolver>>,
    refresh_seconds: u64,
) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(refresh_seconds.max(1)));
        interval.tick().await; // first tick fires immediately; we already did the initial fetch
        loop {
            interval.tick().await;
            match client.force_refresh().await {
                Ok(keys) => identity.write().await.set_keys(keys),
                Err(e) => warn!("jwks refresh failed, keeping previous key set: {e}"),
            }
        }
    });
}

/// Waits for SIGINT or SIGTERM, then lets axum drain in-flight connections.
async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("received SIGINT, starting graceful shutdown"),
            Err(e) => error!("failed to listen for SIGINT: {e}"),
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
                info!("received SIGTERM, starting graceful shutdown");
            }
            Err(e) => {
                error!("failed to listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
