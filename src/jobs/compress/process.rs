use std::{path::PathBuf, sync::Arc};

use anyhow::{anyhow, Error};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{sync::mpsc, task};
use tracing::{debug, warn};

use super::{CompressionSettings, Progress};
use crate::services::job::{Job, JobCtx, State};

#[derive(Debug, Serialize, Deserialize)]
pub struct CompressJob {
    input: PathBuf,
    settings: CompressionSettings,
}

impl CompressJob {
    pub fn new(input: PathBuf, settings: CompressionSettings) -> Self {
        Self { input, settings }
    }
}

/// Runs the blocking compressor off the async workers and mirrors its
/// progress into the job row.
#[async_trait]
#[typetag::serde]
impl Job for CompressJob {
    async fn run(&self, state: &State, jctx: JobCtx) -> Result<serde_json::Value, Error> {
        let compressor = Arc::clone(&state.compressor);
        let input = self.input.clone();
        let settings = self.settings;
        let (tx, mut rx) = mpsc::unbounded_channel::<Progress>();

        let handle = task::spawn_blocking(move || {
            compressor.compress(&input, &settings, |p| {
                // receiver only goes away if the job future was dropped
                let _ = tx.send(p);
            })
        });

        // closes once the compressor (and with it the sender) is done
        while let Some(progress) = rx.recv().await {
            if let Err(err) = jctx.update(state, &json!(progress)).await {
                warn!("could not record progress for job {}: {}", jctx.id, err);
            }
        }

        let result = handle
            .await
            .map_err(|e| anyhow!("compression task panicked: {}", e))??;
        debug!("job {} produced {:?}", jctx.id, result);

        Ok(json!(result))
    }
}
