use std::sync::Arc;

use mailclerk::analysis::Analyzer;
use mailclerk::config::AppConfig;
use mailclerk::http::{AppState, api_routes};
use mailclerk::mailbox::Pop3Mailbox;
use mailclerk::notion::NotionClient;
use mailclerk::pipeline::Pipeline;
use mailclerk::scheduler::Scheduler;
use mailclerk::settings::SettingsStore;
use mailclerk::store::{CategoryStore, Db, RecordStore};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Install rustls crypto provider before any TLS usage
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let config = AppConfig::from_env();
    let _log_guard = init_tracing(&config);

    let db = Db::open(&config.db_path).await?;
    let records = RecordStore::new(db.clone());
    let categories = CategoryStore::new(db.clone());
    let settings = SettingsStore::new(db.clone());
    categories.seed_defaults().await?;
    settings.seed_defaults().await?;

    let mailbox = Arc::new(Pop3Mailbox::new(settings.clone(), records.clone()));
    let analyzer = Analyzer::new(settings.clone());
    let notion = NotionClient::new(settings.clone());

    let pipeline = Arc::new(Pipeline::new(
        mailbox.clone(),
        Arc::new(analyzer.clone()),
        Arc::new(notion.clone()),
        records.clone(),
        categories.clone(),
        settings.clone(),
    ));
    let scheduler = Arc::new(Scheduler::new(pipeline.clone(), settings.clone()));

    // Resume the ticker when settings say it should be on.
    let sched = settings.scheduler().await?;
    if sched.enabled {
        scheduler.start(sched.interval_minutes).await?;
        info!(
            interval_minutes = sched.interval_minutes,
            "Scheduler resumed from settings"
        );
    }

    let state = AppState {
        pipeline,
        scheduler: scheduler.clone(),
        records,
        categories,
        settings,
        mailbox,
        analyzer,
        notion,
    };
    let app = api_routes(state, &config.frontend_origin);

    eprintln!("📬 Mailclerk v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   API:      http://0.0.0.0:{}/api", config.http_port);
    eprintln!("   Health:   http://0.0.0.0:{}/health", config.http_port);
    eprintln!("   Database: {}", config.db_path.display());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.http_port)).await?;
    info!(port = config.http_port, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    scheduler.stop().await;
    info!("Shutdown complete");
    Ok(())
}

/// Log to stdout, or to daily-rolling files when a log directory is
/// configured. The returned guard must stay alive so buffered lines are
/// flushed on exit.
fn init_tracing(config: &AppConfig) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    match &config.log_dir {
        Some(dir) => {
            let appender = tracing_appender::rolling::daily(dir, "mailclerk.log");
            let (writer, guard) = tracing_appender::non_blocking(appender);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .with_ansi(false)
                .with_writer(writer)
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_target(false)
                .init();
            None
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "Failed to listen for shutdown signal");
        return;
    }
    info!("Shutdown signal received");
}
