// Flood Alert API v0.1
use axum::{
    routing::{get, post},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

mod config;
mod db;
mod domain;
mod errors;
mod helpers;
mod routes;
mod services;

use config::{AppConfig, RulesConfig};
use db::store::{MemoryStore, PgStore, Store};
use routes::health::HealthState;
use routes::nodes::NodesState;
use services::calibration::CalibrationService;
use services::hydraulic::ProfileRegistry;
use services::pipeline::{NodeRouter, PipelineContext};
use services::scheduler::{SchedulerState, SharedSchedulerState};

/// Maximum number of connections in the database pool.
const DB_POOL_MAX_CONNECTIONS: u32 = 5;
/// Minimum number of connections kept alive in the database pool.
const DB_POOL_MIN_CONNECTIONS: u32 = 2;

/// Flood Alert API OpenAPI specification.
#[derive(OpenApi)]
#[openapi(
    info(
        title = "Flood Alert API",
        version = "0.1.0",
        description = "Flood telemetry pipeline for weir-mounted water level sensors. \
            Normalizes and quality-checks node telemetry, derives head and discharge \
            from calibrated H–Q profiles, combines rainfall from several weather \
            providers into a consensus, and turns it all into per-horizon flood \
            probabilities and debounced Early/High alerts.",
        license(name = "MIT"),
    ),
    tags(
        (name = "Health", description = "Service health check"),
        (name = "Telemetry", description = "Telemetry ingress (push and topic bridge)"),
        (name = "Nodes", description = "Per-node telemetry, forecasts, alerts and device registry"),
        (name = "Calibration", description = "Head–discharge calibration"),
        (name = "Weather", description = "Rainfall consensus"),
        (name = "Scheduler", description = "Background re-evaluation status"),
    ),
    paths(
        routes::health::health_check,
        routes::telemetry::post_telemetry,
        routes::bridge::post_bridge_message,
        routes::nodes::get_node_telemetry,
        routes::nodes::get_node_forecasts,
        routes::nodes::get_node_alerts,
        routes::nodes::get_node_profile,
        routes::nodes::get_node_consensus,
        routes::calibration::post_calibration,
        routes::devices::list_devices,
        routes::scheduler::get_scheduler_status,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            services::ingest::TelemetryPayload,
            services::ingest::SensorReadings,
            services::ingest::PayloadMeta,
            services::pipeline::IngestReceipt,
            services::calibration::CalibrationSample,
            services::calibration::CalibrationReport,
            services::calibration::HqFit,
            services::calibration::FitMethod,
            services::weather::ConsensusReport,
            services::weather::WeatherSample,
            routes::scheduler::SchedulerStatus,
            services::scheduler::NodeEvaluationStatus,
            domain::TelemetryRecord,
            domain::TelemetryObservation,
            domain::HydraulicState,
            domain::QcFlag,
            domain::QcFlags,
            domain::HqProfile,
            domain::ConsensusEstimate,
            domain::ConsensusStatus,
            domain::Confidence,
            domain::ForecastRecord,
            domain::AlertLevel,
            domain::AlertEvent,
            domain::DeviceRecord,
            errors::ErrorResponse,
        )
    )
)]
struct ApiDoc;

fn init_tracing(json_logs: bool) {
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "flood_alert_api=debug,tower_http=debug".into());
    let registry = tracing_subscriber::registry().with(filter);
    if json_logs {
        registry.with(tracing_subscriber::fmt::layer().json()).init();
    } else {
        registry.with(tracing_subscriber::fmt::layer()).init();
    }
}

#[tokio::main]
async fn main() {
    let config = AppConfig::from_env();
    init_tracing(config.json_logs);

    // Rules: thresholds and model coefficients, shared read-only
    let mut rules = RulesConfig::load(config.rules_path.as_deref().map(std::path::Path::new))
        .expect("Failed to load rules");
    if let Some(lat) = config.default_latitude {
        rules.default_site.latitude = lat;
    }
    if let Some(lon) = config.default_longitude {
        rules.default_site.longitude = lon;
    }
    tracing::info!(
        "Loaded rules version {} ({} configured node site(s))",
        rules.version,
        rules.nodes.len()
    );
    let rules = Arc::new(rules);

    // Store: PostgreSQL when configured, otherwise process memory
    let store: Arc<dyn Store> = match &config.database_url {
        Some(url) => {
            let pool = PgPoolOptions::new()
                .max_connections(DB_POOL_MAX_CONNECTIONS)
                .min_connections(DB_POOL_MIN_CONNECTIONS)
                .connect(url)
                .await
                .expect("Failed to connect to database");

            sqlx::migrate!()
                .run(&pool)
                .await
                .expect("Failed to run database migrations");

            tracing::info!("Database migrations completed");
            Arc::new(PgStore::new(pool))
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-memory store; data is lost on restart");
            Arc::new(MemoryStore::new())
        }
    };

    // Active H–Q profiles
    let profiles = Arc::new(ProfileRegistry::new());
    match store.active_profiles().await {
        Ok(active) => tracing::info!("Loaded {} calibration profile(s)", profiles.load(active)),
        Err(e) => tracing::error!("Failed to load calibration profiles: {}", e),
    }

    let aggregator = Arc::new(services::weather::build_aggregator(&config, rules.weather.clone()));

    let router = Arc::new(NodeRouter::new(PipelineContext::new(
        store.clone(),
        profiles.clone(),
        aggregator.clone(),
        rules.clone(),
    )));

    // Known devices get their pipeline up front so the scheduler covers them
    match store.list_devices().await {
        Ok(devices) => {
            for device in &devices {
                router.register(&device.node_id);
            }
        }
        Err(e) => tracing::error!("Failed to read device registry: {}", e),
    }

    let calibration = Arc::new(CalibrationService::new(
        store.clone(),
        profiles.clone(),
        rules.clone(),
    ));

    // Background re-evaluation
    let scheduler_state: SharedSchedulerState =
        Arc::new(RwLock::new(SchedulerState::new(config.eval_interval_secs)));
    tokio::spawn(services::scheduler::run_scheduler(
        router.clone(),
        scheduler_state.clone(),
    ));

    // Topic subscription, fed by the bridge route
    let (publisher, topic_rx) = services::subscribe::channel();
    tokio::spawn(services::subscribe::run_subscriber(
        config.topic_namespace.clone(),
        router.clone(),
        topic_rx,
    ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
        .allow_headers(Any);

    // Build router
    let telemetry_routes = Router::new()
        .route("/api/v1/telemetry", post(routes::telemetry::post_telemetry))
        .with_state(router.clone());

    let bridge_routes = Router::new()
        .route(
            "/api/v1/bridge/*topic",
            post(routes::bridge::post_bridge_message),
        )
        .with_state(publisher);

    let node_routes = Router::new()
        .route(
            "/api/v1/nodes/:node_id/telemetry",
            get(routes::nodes::get_node_telemetry),
        )
        .route(
            "/api/v1/nodes/:node_id/forecasts",
            get(routes::nodes::get_node_forecasts),
        )
        .route(
            "/api/v1/nodes/:node_id/alerts",
            get(routes::nodes::get_node_alerts),
        )
        .route(
            "/api/v1/nodes/:node_id/profile",
            get(routes::nodes::get_node_profile),
        )
        .route(
            "/api/v1/nodes/:node_id/consensus",
            get(routes::nodes::get_node_consensus),
        )
        .with_state(NodesState {
            store: store.clone(),
            profiles,
            aggregator,
            rules,
        });

    let calibration_routes = Router::new()
        .route(
            "/api/v1/nodes/:node_id/calibration",
            post(routes::calibration::post_calibration),
        )
        .with_state(calibration);

    let device_routes = Router::new()
        .route("/api/v1/devices", get(routes::devices::list_devices))
        .with_state(store.clone());

    // Health check verifies store connectivity
    let health_routes = Router::new()
        .route("/api/v1/health", get(routes::health::health_check))
        .with_state(HealthState { store, router });

    let scheduler_routes = Router::new()
        .route(
            "/api/v1/scheduler/status",
            get(routes::scheduler::get_scheduler_status),
        )
        .with_state(scheduler_state);

    let app = Router::new()
        .merge(health_routes)
        .merge(telemetry_routes)
        .merge(bridge_routes)
        .merge(node_routes)
        .merge(calibration_routes)
        .merge(device_routes)
        .merge(scheduler_routes)
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    // Start server
    let addr = SocketAddr::from(([0, 0, 0, 0], config.port));
    tracing::info!("API server listening on {}", addr);
    tracing::info!(
        "Swagger UI available at http://localhost:{}/swagger-ui/",
        config.port
    );

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .expect("Failed to bind TCP listener");
    axum::serve(listener, app)
        .await
        .expect("Server terminated unexpectedly");
}
