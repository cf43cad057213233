//! CareHub API Gateway
//!
//! The entry point for all hospital-facing API requests.
//! Handles:
//! - Client allow-listing and authentication
//! - Tenant resolution and schema-bound database sessions
//! - Role-based authorization
//! - Realtime fan-out over WebSockets
//! - Observability (logging, metrics, tracing)

mod handlers;
mod middleware;


use axum::{
    middleware::{from_fn, from_fn_with_state},
    routing::{get, post},
    Router,
};
use carehub_common::{
    auth::{AuthenticationGate, CredentialVerifier, UserDirectory},
    config::{AppConfig, RuntimeEnv},
    db::{DbPool, Repository},
    events::TenantEventBus,
    metrics,
    rbac::{Authorizer, RoleStore},
    session::{postgres::PgTenantPool, ConnectionPool},
    tenancy::{TenantResolver, TenantStore},
    SchemaSessionManager,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::middleware::ResourcePolicy;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub tenants: TenantResolver,
    pub sessions: SchemaSessionManager,
    pub auth: AuthenticationGate,
    pub authorizer: Authorizer,
    pub events: Arc<TenantEventBus>,
}

impl AppState {
    /// Wire the pipeline components over one registry and one session pool
    pub fn new<R>(
        config: Arc<AppConfig>,
        registry: Arc<R>,
        pool: Arc<dyn ConnectionPool>,
        verifier: CredentialVerifier,
    ) -> Self
    where
        R: TenantStore + UserDirectory + RoleStore + 'static,
    {
        let tenant_store: Arc<dyn TenantStore> = registry.clone();
        let users: Arc<dyn UserDirectory> = registry.clone();
        let roles: Arc<dyn RoleStore> = registry;

        Self {
            tenants: TenantResolver::new(tenant_store, &config.tenancy),
            sessions: SchemaSessionManager::new(pool, config.database.default_search_path.clone()),
            auth: AuthenticationGate::new(Arc::new(verifier), users, config.auth.jit_provisioning),
            authorizer: Authorizer::new(roles),
            events: Arc::new(TenantEventBus::new(config.realtime.channel_capacity)),
            config,
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    let env = RuntimeEnv::from_env();

    // Load configuration
    let config = AppConfig::load(env).map_err(|e| {
        eprintln!("Failed to load configuration: {e}");
        e
    })?;
    let config = Arc::new(config);

    // Initialize tracing
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));
    if config.observability.json_logging {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(true)
            .init();
    }

    info!(
        env = env.as_str(),
        service = %config.observability.service_name,
        "Starting CareHub API Gateway v{}",
        carehub_common::VERSION
    );

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let metrics_addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(metrics_addr)
            .set_buckets_for_metric(
                Matcher::Suffix("_seconds".to_string()),
                metrics::LATENCY_BUCKETS,
            )?
            .install()?;
        info!("Metrics exporter listening on {}", metrics_addr);
    }
    metrics::register_metrics();

    // Initialize database connection
    let db = DbPool::new(&config.database).await?;
    let registry = Arc::new(Repository::new(db.clone()));
    let pool: Arc<dyn ConnectionPool> = Arc::new(PgTenantPool::new(db.sessions.clone()));

    let verifier = CredentialVerifier::from_config(&config.auth, env)?;

    // Create app state
    let state = AppState::new(config.clone(), registry, pool, verifier);

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("Server shutdown complete");
    Ok(())
}

/// Create the main application router
fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    // Tenant routes: credential, tenant, session, identity, then permission
    let bed_routes = Router::new()
        .route("/beds", get(handlers::beds::list_beds).post(handlers::beds::create_bed))
        .route_layer(from_fn_with_state(
            ResourcePolicy::new("beds"),
            middleware::require_permission,
        ));

    let tenant_routes = Router::new()
        .merge(bed_routes)
        .route("/me", get(handlers::me::me))
        .route_layer(from_fn_with_state(state.clone(), middleware::tenant_pipeline));

    // Admin routes: credential plus the system-admin group, no tenant binding
    let admin_routes = Router::new()
        .route("/admin/tenants/{id}", get(handlers::admin::get_tenant))
        .route("/admin/notices", post(handlers::admin::post_notice))
        .route_layer(from_fn_with_state(state.clone(), middleware::system_admin));

    let api_routes = Router::new()
        .merge(tenant_routes)
        .merge(admin_routes)
        .route_layer(from_fn_with_state(state.clone(), middleware::check_application));

    // Compose the app
    Router::new()
        // Health endpoints (no auth)
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        // Realtime handshake authenticates from query parameters
        .route("/ws", get(handlers::realtime::ws_handler))
        .merge(api_routes)
        .layer(from_fn(middleware::track_request))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
