//! AnswerForge Context Engine
//!
//! Query answering service providing:
//! - Search-need classification
//! - Question decomposition and parallel sub-answers
//! - Cited answer synthesis
//! - Budgeted runs with streamed progress

mod handlers;

use axum::{
    routing::{get, post},
    Router,
};
use answerforge_common::{
    config::{AppConfig, RunConfig},
    llm::OpenAiCompatibleClient,
    metrics,
    retrieval::HttpRetrievalClient,
    AnswerEngine, VERSION,
};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder};
use std::future::IntoFuture;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::oneshot;
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub engine: AnswerEngine,
    /// Run configuration requests start from
    pub run_defaults: Arc<RunConfig>,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Load configuration
    let config = AppConfig::load()?;

    init_tracing(&config);
    info!("Starting AnswerForge Context Engine v{}", VERSION);

    // Initialize metrics
    if config.observability.metrics_port != 0 {
        let addr = SocketAddr::from(([0, 0, 0, 0], config.observability.metrics_port));
        PrometheusBuilder::new()
            .with_http_listener(addr)
            .set_buckets_for_metric(
                Matcher::Suffix("run_duration_seconds".to_string()),
                metrics::RUN_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Suffix("llm_duration_seconds".to_string()),
                metrics::CALL_BUCKETS,
            )?
            .set_buckets_for_metric(
                Matcher::Suffix("retrieval_duration_seconds".to_string()),
                metrics::CALL_BUCKETS,
            )?
            .install()?;
        info!("Metrics exporter listening on {}", addr);
    }
    metrics::register_metrics();

    let run_defaults = config.run.clone().validated()?;
    info!(
        max_steps = run_defaults.max_steps,
        max_tokens = run_defaults.max_tokens_per_run,
        max_wall_clock_ms = run_defaults.max_wall_clock_per_run_ms,
        "Run budgets loaded"
    );

    // Initialize backends
    let llm = OpenAiCompatibleClient::new(config.llm.clone())?;
    let retrieval = HttpRetrievalClient::new(config.retrieval.clone())?;

    let state = AppState {
        engine: AnswerEngine::new(Arc::new(llm), Arc::new(retrieval)),
        run_defaults: Arc::new(run_defaults),
    };

    // Build the router
    let app = create_router(state);

    // Start the server
    let addr: SocketAddr = format!("{}:{}", config.server.host, config.server.port).parse()?;
    info!("Listening on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    // In-flight runs get a bounded grace period once a signal arrives
    let (draining_tx, draining_rx) = oneshot::channel::<()>();
    let server = axum::serve(listener, app).with_graceful_shutdown(async move {
        shutdown_signal().await;
        let _ = draining_tx.send(());
    });

    let grace = config.shutdown_timeout();
    let deadline = async move {
        match draining_rx.await {
            Ok(()) => tokio::time::sleep(grace).await,
            Err(_) => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        result = server.into_future() => result?,
        () = deadline => warn!(grace_secs = grace.as_secs(), "Graceful shutdown timed out, dropping open connections"),
    }

    info!("Server shutdown complete");
    Ok(())
}

fn init_tracing(config: &AppConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&config.observability.log_level));

    let builder = tracing_subscriber::fmt().with_env_filter(filter).with_target(true);
    if config.observability.json_logging {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let api_routes = Router::new()
        .route("/answer", post(handlers::answer::answer))
        .route("/answer/stream", post(handlers::answer::answer_stream));

    Router::new()
        .route("/health", get(handlers::health::health))
        .nest("/v1", api_routes)
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C, starting shutdown..."),
        _ = terminate => info!("Received SIGTERM, starting shutdown..."),
    }
}
