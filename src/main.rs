pub mod config;
pub mod error;
pub mod helpers;
pub mod jobs;
pub mod quality;
pub mod routes;
pub mod services;

use std::sync::Arc;

use anyhow::Context;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use jobs::compress::VideoCompressor;
use quality::QualityAssessor;
use services::{db::Database, job};

const DEFAULT_LOG_FILTER: &str = "info,squeeze=debug";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = Config::from_env()?;
    let mut closer = helpers::Closer::new();

    let db = Database::open(&config.db_path)?;
    let assessor = QualityAssessor::load(&config.quality, &config.tools)?;
    let compressor = VideoCompressor::new(config.tools.clone(), Arc::new(assessor));
    let state = job::State {
        db,
        compressor: Arc::new(compressor),
    };
    let jobs = job::JobsService::new(state, &mut closer, 1)?;

    let app = routes::router(jobs);
    let listener = tokio::net::TcpListener::bind(config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    info!("listening on {}", config.bind);

    axum::serve(listener, app)
        .with_graceful_shutdown(helpers::do_shutdown())
        .await?;

    closer.close().await;
    info!("shutdown complete");
    Ok(())
}
