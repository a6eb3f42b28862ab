use std::{sync::Arc, time::Duration};

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::{
    select,
    sync::oneshot,
    task,
    time::{self, Instant},
};
use tracing::{debug, error, info, instrument, trace, warn};

use super::db::{query, query_tx, row_extract, Database};
use crate::{error::AppError, helpers::Closer, jobs::compress::VideoCompressor};

const JOB_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// Queue of background jobs, persisted in the `job_queue` table.
pub struct JobsService {
    db: Arc<Database>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct JobRow {
    pub id: i32,
    pub args: serde_json::Value,
    pub job_type: String,
    pub state: String,
    pub scheduled: i64,
    pub completed: Option<i64>,
    pub active: Option<i64>,
    pub output: Option<serde_json::Value>,
}

const JOB_COLUMNS: &str = "id, args, job_type, state, scheduled, completed, active, output";

impl JobRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        let args: String = row.get(1)?;
        let output: Option<String> = row.get(7)?;
        Ok(JobRow {
            id: row.get(0)?,
            args: serde_json::from_str(&args).unwrap_or(serde_json::Value::String(args)),
            job_type: row.get(2)?,
            state: row.get(3)?,
            scheduled: row.get(4)?,
            completed: row.get(5)?,
            active: row.get(6)?,
            output: output.map(|o| serde_json::from_str(&o).unwrap_or(serde_json::Value::String(o))),
        })
    }
}

impl JobsService {
    /// Start `concurrent_jobs` workers draining the queue. Zero gives a
    /// queue that only records jobs.
    pub fn new(state: State, closer: &mut Closer, concurrent_jobs: usize) -> Result<Arc<Self>> {
        let interrupted = fail_interrupted(&state.db)?;
        if interrupted > 0 {
            warn!("marked {} interrupted job(s) as failed", interrupted);
        }

        for _ in 0..concurrent_jobs {
            let state = state.clone();

            let (close_tx, close_rx) = oneshot::channel();
            let worker = task::spawn(async move {
                info!("starting background job worker");
                worker_jobs_loop(&state, close_rx).await;
            });

            closer.add(async move {
                let _ = close_tx.send(());
                if let Err(err) = worker.await {
                    error!("background job worker failed to stop cleanly: {}", err);
                }
            });
        }

        Ok(Arc::new(Self {
            db: Arc::clone(&state.db),
        }))
    }

    /// Enqueue a job unless another one is still queued or running,
    /// returning its kind and id.
    #[instrument(skip(self, job))]
    pub async fn enqueue_exclusive<J>(&self, job: J) -> Result<(String, i32), AppError>
    where
        J: Job + Serialize,
    {
        let kind = job.typetag_name();
        let args = serde_json::to_string(&job as &dyn Job).map_err(anyhow::Error::from)?;

        let id: Option<i32> = query_tx(&self.db, |tx| {
            let (busy,): (i64,) = tx.query_row(
                "SELECT count(*) FROM job_queue WHERE state IN ('queued', 'running')",
                [],
                row_extract,
            )?;
            if busy > 0 {
                return Ok(None);
            }

            let id = tx
                .prepare_cached(
                    "INSERT INTO job_queue (scheduled, state, args, job_type) VALUES (unixepoch(), 'queued', ?, ?) \
                     RETURNING id",
                )?
                .query_row((&args, kind), |row| row.get::<_, i32>(0))?;
            tx.commit()?;
            Ok(Some(id))
        })?;

        let id = id.ok_or(AppError::Busy)?;
        info!("enqueued background job of kind: {} with id: {}", kind, id);
        Ok((kind.to_string(), id))
    }

    /// List all jobs, oldest first
    pub async fn list(&self) -> Result<Vec<JobRow>> {
        query(&self.db, |conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT {} FROM job_queue ORDER BY scheduled, id",
                JOB_COLUMNS
            ))?;

            let rows = stmt
                .query_map([], JobRow::from_row)?
                .collect::<rusqlite::Result<Vec<JobRow>>>()?;
            Ok(rows)
        })
    }

    pub async fn get(&self, id: i32) -> Result<Option<JobRow>> {
        query(&self.db, |conn| {
            let row = conn
                .prepare_cached(&format!("SELECT {} FROM job_queue WHERE id = ?", JOB_COLUMNS))?
                .query_row((id,), JobRow::from_row);
            match row {
                Ok(row) => Ok(Some(row)),
                Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
                Err(err) => Err(err.into()),
            }
        })
    }
}

/// Jobs are never retried, so anything still `running` at startup died with
/// the previous process.
fn fail_interrupted(db: &Database) -> Result<usize> {
    let output = json!({ "error": "interrupted before completion" }).to_string();
    query(db, |conn| {
        Ok(conn
            .prepare_cached(
                "UPDATE job_queue SET state = 'failed', completed = unixepoch(), active = NULL, output = ? \
                 WHERE state = 'running'",
            )?
            .execute((&output,))?)
    })
}

async fn worker_jobs_loop(state: &State, mut close_rx: oneshot::Receiver<()>) {
    loop {
        select! {
            result = execute_next_job(state) => {
                if let Err(err) = result {
                    error!("error performing background job work: {}", err);
                }
            }
            _ = &mut close_rx => {
                info!("background job worker shutting down...");
                return;
            }
        }
    }
}

/// Claim the oldest queued job, marking it running.
fn claim_next(db: &Database) -> Result<Option<(i32, String)>> {
    query(db, |conn| {
        let maybe_row: rusqlite::Result<(i32, String)> = conn
            .prepare_cached(
                r#"
                UPDATE job_queue
                SET state = 'running',
                    active = unixepoch()
                WHERE id =
                    (SELECT id
                     FROM job_queue
                     WHERE state = 'queued'
                     ORDER BY scheduled, id
                     LIMIT 1) RETURNING id,
                                        args
                "#,
            )?
            .query_row([], row_extract);

        match maybe_row {
            Ok(data) => Ok(Some(data)),
            Err(rusqlite::Error::QueryReturnedNoRows) => Ok(None),
            Err(err) => Err(err.into()),
        }
    })
}

async fn load_job(db: &Database) -> Result<(i32, Box<dyn Job>)> {
    let (id, args) = loop {
        trace!("attempting to load job from queue");
        if let Some(data) = claim_next(db)? {
            break data;
        }
        trace!(
            "background job queue is empty. trying again in {:?}",
            JOB_POLL_INTERVAL
        );
        time::sleep(JOB_POLL_INTERVAL).await;
    };

    match serde_json::from_str(&args) {
        Ok(job) => Ok((id, job)),
        Err(err) => {
            let res = Err(anyhow!("could not decode job arguments: {}", err));
            save_job_result(db, id, &res)?;
            Err(anyhow!("dropped undecodable job {}", id))
        }
    }
}

async fn run_job(state: &State) -> Result<(i32, Result<serde_json::Value>)> {
    let (id, job) = load_job(&state.db).await?;
    debug!("pulled background job with id: {} from queue", id);
    let start = Instant::now();
    let res = job.run(state, JobCtx { id }).await;

    debug!(
        "finished running background job with id: {}, took {:?}",
        id,
        start.elapsed()
    );

    Ok((id, res))
}

// Update job information without setting state to completed
fn update_job(db: &Database, id: i32, new_data: &serde_json::Value) -> Result<()> {
    let data = new_data.to_string();
    query(db, |conn| {
        conn.prepare_cached("UPDATE job_queue SET output = ? WHERE id = ? AND state = 'running'")?
            .execute((&data, id))?;
        Ok(())
    })
}

fn save_job_result(db: &Database, id: i32, res: &Result<serde_json::Value>) -> Result<()> {
    let (job_state, output) = match res {
        Ok(output) => {
            debug!("successfully completed background job with id: {}", id);
            ("completed", serde_json::to_string(output)?)
        }
        Err(err) => {
            error!("error executing background job with id {}: {:#}", id, err);
            ("failed", json!({ "error": err.to_string() }).to_string())
        }
    };

    query(db, |conn| {
        conn.prepare_cached(
            "UPDATE job_queue SET state = ?, completed = unixepoch(), output = ?, active = \
             NULL WHERE id = ?",
        )?
        .execute((job_state, &output, id))?;

        Ok(())
    })
}

#[instrument(skip(state), err)]
async fn execute_next_job(state: &State) -> Result<()> {
    let (id, res) = run_job(state).await?;
    save_job_result(&state.db, id, &res)?;
    Ok(())
}

pub struct JobCtx {
    pub id: i32,
}

impl JobCtx {
    /// Updates job information (in 'output' column). Will not change the job state.
    pub async fn update(&self, state: &State, update_to: &serde_json::Value) -> Result<()> {
        update_job(&state.db, self.id, update_to)
    }
}

#[derive(Clone)]
pub struct State {
    pub db: Arc<Database>,
    pub compressor: Arc<VideoCompressor>,
}

#[async_trait]
#[typetag::serde(tag = "type")]
pub trait Job: Send + Sync {
    async fn run(&self, state: &State, info: JobCtx) -> Result<serde_json::Value>;
}
