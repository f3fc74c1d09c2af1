use abtest::{ExperimentManager, ExperimentRepository, ExperimentStore};
use axum::{
    extract::DefaultBodyLimit,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use crate::handlers::{experiments, health::health, AppState};

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:7800";
const DEFAULT_MAX_BODY_MB: usize = 10;

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/ab-tests",
            post(experiments::create_experiment).get(experiments::list_experiments),
        )
        .route(
            "/ab-tests/:id",
            get(experiments::get_experiment)
                .patch(experiments::update_experiment)
                .delete(experiments::delete_experiment),
        )
        .route("/ab-tests/:id/start", post(experiments::start_experiment))
        .route("/ab-tests/:id/pause", post(experiments::pause_experiment))
        .route("/ab-tests/:id/resume", post(experiments::resume_experiment))
        .route("/ab-tests/:id/events", post(experiments::record_events))
        .route("/ab-tests/:id/results", get(experiments::get_results))
        .route("/ab-tests/:id/winner", post(experiments::declare_winner))
        .route(
            "/ab-tests/:id/winner/apply",
            post(experiments::apply_winner),
        )
        .route(
            "/ab-tests/:id/assignments/:member_id",
            get(experiments::get_assignment),
        )
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn build_repository(
    data_dir: &str,
    in_memory: bool,
) -> Result<Arc<dyn ExperimentRepository>, Box<dyn std::error::Error>> {
    if in_memory {
        tracing::warn!("running with an in-memory store; experiments are lost on exit");
        return Ok(Arc::new(ExperimentStore::in_memory()));
    }
    let store = ExperimentStore::open(std::path::Path::new(data_dir))?;
    tracing::info!(data_dir, experiments = store.len(), "experiment store opened");
    Ok(Arc::new(store))
}

pub async fn serve() -> Result<(), Box<dyn std::error::Error>> {
    let startup_start = std::time::Instant::now();

    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    let data_dir = std::env::var("ABTEST_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let bind_addr =
        std::env::var("ABTEST_BIND_ADDR").unwrap_or_else(|_| DEFAULT_BIND_ADDR.to_string());
    let in_memory = std::env::var("ABTEST_IN_MEMORY")
        .ok()
        .filter(|v| v == "1")
        .is_some();
    let max_body_mb = std::env::var("ABTEST_MAX_BODY_MB")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(DEFAULT_MAX_BODY_MB);

    let repository = build_repository(&data_dir, in_memory)?;
    let state = Arc::new(AppState::new(ExperimentManager::new(repository)));

    let app = router(state)
        .layer(DefaultBodyLimit::max(max_body_mb * 1024 * 1024))
        .layer(CorsLayer::very_permissive().max_age(std::time::Duration::from_secs(86400)));

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    let local_addr = listener.local_addr()?;

    print_startup_banner(
        &local_addr.to_string(),
        startup_start.elapsed().as_millis(),
        if in_memory { None } else { Some(data_dir.as_str()) },
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %err, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

fn print_startup_banner(bind_addr: &str, startup_ms: u128, data_dir: Option<&str>) {
    use colored::Colorize;

    let url = format!("http://{}", bind_addr);
    let version = format!("v{}", env!("CARGO_PKG_VERSION"));
    let timing = format!("ready in {}ms", startup_ms);

    println!();
    println!(
        "  {} {}  {}",
        "abtest".bold().bright_green(),
        version.as_str().dimmed(),
        timing.as_str().dimmed(),
    );
    println!();
    println!("  {}  Local:      {}", "➜".green(), url.as_str().cyan());
    match data_dir {
        Some(dir) => println!("  {}  Data:       {}", "➜".green(), dir.cyan()),
        None => println!("  {}  Data:       {}", "➜".green(), "in-memory".yellow()),
    }
    println!();
}
