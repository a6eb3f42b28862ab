use std::{path::Path, path::PathBuf, sync::Arc};

use axum::{
    extract::Path as UrlPath,
    routing::{get, post},
    Extension, Json, Router,
};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::{
    error::AppError,
    helpers,
    jobs::compress::{
        CompressJob, CompressionSettings, Preset, TargetResolution, DEFAULT_BITRATE_MBPS,
    },
    services::job::JobsService,
};

/// Containers the compressor accepts as input.
pub const VIDEO_EXTENSIONS: [&str; 4] = ["mp4", "avi", "mkv", "mov"];

#[derive(Debug, Deserialize)]
pub struct CompressRequest {
    pub input_path: PathBuf,
    #[serde(default = "default_preset")]
    pub preset: String,
    #[serde(default = "default_bitrate")]
    pub bitrate_mbps: f64,
    #[serde(default = "default_resolution")]
    pub resolution: String,
}

fn default_preset() -> String {
    Preset::Medium.name().into()
}

fn default_bitrate() -> f64 {
    DEFAULT_BITRATE_MBPS
}

fn default_resolution() -> String {
    TargetResolution::Original.name().into()
}

pub fn router(jobs: Arc<JobsService>) -> Router {
    Router::new()
        .route("/compress", post(compress))
        .route("/jobs", get(list_jobs))
        .route("/jobs/:id", get(get_job))
        .route("/presets", get(presets))
        .fallback(helpers::handler_404)
        .layer(Extension(jobs))
}

pub fn validate_container(path: &Path) -> Result<(), AppError> {
    let supported = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| VIDEO_EXTENSIONS.iter().any(|v| v.eq_ignore_ascii_case(e)))
        .unwrap_or(false);
    if supported {
        Ok(())
    } else {
        Err(AppError::Validation(format!(
            "unsupported video file {}, expected one of: {}",
            path.display(),
            VIDEO_EXTENSIONS.join(", ")
        )))
    }
}

#[axum_macros::debug_handler]
async fn compress(
    Extension(jobs): Extension<Arc<JobsService>>,
    Json(req): Json<CompressRequest>,
) -> Result<Json<serde_json::Value>, AppError> {
    validate_container(&req.input_path)?;
    let settings = CompressionSettings::parse(&req.preset, req.bitrate_mbps, &req.resolution)?;
    if !req.input_path.is_file() {
        return Err(AppError::Validation(format!(
            "input video not found: {}",
            req.input_path.display()
        )));
    }

    debug!("compressing {} with {:?}", req.input_path.display(), settings);
    let (typ, id) = jobs
        .enqueue_exclusive(CompressJob::new(req.input_path, settings))
        .await?;

    Ok(Json(json!({
        "job_type": typ,
        "job_id": id
    })))
}

async fn list_jobs(
    Extension(jobs): Extension<Arc<JobsService>>,
) -> Result<Json<serde_json::Value>, AppError> {
    let list = jobs.list().await?;
    Ok(Json(json!(list)))
}

async fn get_job(
    Extension(jobs): Extension<Arc<JobsService>>,
    UrlPath(id): UrlPath<i32>,
) -> Result<Json<serde_json::Value>, AppError> {
    let job = jobs.get(id).await?.ok_or(AppError::NotFound)?;
    Ok(Json(json!(job)))
}

async fn presets() -> Json<serde_json::Value> {
    let table: serde_json::Map<String, serde_json::Value> = Preset::ALL
        .into_iter()
        .map(|p| (p.name().to_string(), json!(p.params())))
        .collect();
    Json(json!({
        "presets": table,
        "resolutions": TargetResolution::ALL.map(|r| r.name()),
        "default_bitrate_mbps": DEFAULT_BITRATE_MBPS,
        "containers": VIDEO_EXTENSIONS,
    }))
}
