use std::path::PathBuf;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

use crate::jobs::compress::SettingsError;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("{0}")]
    Generic(#[from] anyhow::Error),
    #[error("{0}")]
    Validation(String),
    #[error(transparent)]
    Settings(#[from] SettingsError),
    #[error("a compression job is already queued or running")]
    Busy,
    #[error("not found")]
    NotFound,
    #[error("error with environment configuration")]
    EnvConfig(#[from] std::env::VarError),
    #[error("invalid configuration value for {key}: {value}")]
    InvalidConfig { key: &'static str, value: String },
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_message) = match self {
            Self::Generic(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("internal server error: {}", err),
            ),
            Self::Validation(msg) => (StatusCode::BAD_REQUEST, msg),
            Self::Settings(err) => (StatusCode::BAD_REQUEST, err.to_string()),
            Self::Busy => (
                StatusCode::CONFLICT,
                "a compression job is already queued or running".into(),
            ),
            Self::NotFound => (StatusCode::NOT_FOUND, "not found".into()),
            Self::EnvConfig(err) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("environment variable error: {}", err),
            ),
            Self::InvalidConfig { key, value } => (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("invalid configuration value for {}: {}", key, value),
            ),
        };

        let body = Json(json!({
            "error": error_message,
        }));

        (status, body).into_response()
    }
}

/// Failures of a single compression run.
#[derive(Error, Debug)]
pub enum CompressError {
    #[error("input video not found: {}", .0.display())]
    InputNotFound(PathBuf),
    #[error("could not probe {}: {reason}", path.display())]
    Probe { path: PathBuf, reason: String },
    #[error("ffmpeg error: {diagnostics}")]
    Encode { diagnostics: String },
    #[error("no frames could be extracted from the video")]
    NoFramesExtracted,
    #[error("model file not found: {}", .0.display())]
    ModelNotFound(PathBuf),
    #[error("compression error: {0}")]
    Processing(#[from] anyhow::Error),
}
