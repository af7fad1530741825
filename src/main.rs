use std::sync::Arc;
use std::time::Duration;

use taskpilot::api::task_routes;
use taskpilot::chat::{ChatRouter, WorkflowArbiter};
use taskpilot::config::EngineConfig;
use taskpilot::providers::stub::{
    RecordingSender, ScriptedDecomposer, ScriptedExecutor, ScriptedExtractor,
};
use taskpilot::store::{Database, LibSqlBackend};
use taskpilot::tasks::service::TaskService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing — console by default, rolling file when
    // TASKPILOT_LOG_DIR is set.
    let env_filter = || {
        tracing_subscriber::EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"))
    };
    let _log_guard = match std::env::var("TASKPILOT_LOG_DIR") {
        Ok(dir) => {
            let appender = tracing_appender::rolling::daily(&dir, "taskpilot.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_writer(writer)
                .with_ansi(false)
                .with_target(false)
                .init();
            Some(guard)
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(env_filter())
                .with_target(false)
                .init();
            None
        }
    };

    let port: u16 = std::env::var("TASKPILOT_PORT")
        .unwrap_or_else(|_| "8080".to_string())
        .parse()
        .unwrap_or(8080);

    let tick_secs: u64 = std::env::var("TASKPILOT_TICK_SECS")
        .unwrap_or_else(|_| "1".to_string())
        .parse()
        .unwrap_or(1);

    eprintln!("🛠  Taskpilot v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Task WS:  ws://0.0.0.0:{}/ws/tasks", port);
    eprintln!("   Task API: http://0.0.0.0:{}/api/tasks", port);
    eprintln!("   Chat API: http://0.0.0.0:{}/api/chat", port);

    // ── Database ─────────────────────────────────────────────────────────
    let db_path =
        std::env::var("TASKPILOT_DB_PATH").unwrap_or_else(|_| "./data/taskpilot.db".to_string());

    let db: Arc<dyn Database> = Arc::new(
        LibSqlBackend::new_local(std::path::Path::new(&db_path))
            .await
            .map_err(|e| anyhow::anyhow!("Failed to open database at {db_path}: {e}"))?,
    );
    eprintln!("   Database: {}", db_path);

    // ── Collaborators ────────────────────────────────────────────────────
    // The engine consumes abstract providers. The binary ships with the
    // scripted dev set; real deployments inject model-backed and
    // platform-backed implementations at this seam.
    let decomposer = Arc::new(ScriptedDecomposer::new());
    let extractor = Arc::new(ScriptedExtractor::new());
    let executor = Arc::new(ScriptedExecutor::new());
    let sender = Arc::new(RecordingSender::new());

    // ── Engine ───────────────────────────────────────────────────────────
    let config = EngineConfig {
        tick_interval: Duration::from_secs(tick_secs),
        ..Default::default()
    };
    let service = TaskService::new(config, db, executor.clone(), sender);

    let arbiter = Arc::new(WorkflowArbiter::new());
    let chat = Arc::new(ChatRouter::new(
        arbiter,
        decomposer,
        extractor,
        executor,
        Arc::clone(&service),
    ));

    // ── API server ───────────────────────────────────────────────────────
    let app = task_routes(service, chat);
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", port)).await?;
    tracing::info!(port, "Taskpilot listening");
    axum::serve(listener, app).await?;

    Ok(())
}
