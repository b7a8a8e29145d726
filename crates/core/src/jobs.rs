//! In-process job registry and its bounded executor.
//!
//! [`JobRegistry`] is the only owner of job records. Submissions are handed to
//! a dispatcher task in submission order; the dispatcher waits for a free
//! worker slot before starting each job, so at most `pool_size` jobs are ever
//! `processing` and queued jobs start strictly in FIFO order. Sampling and
//! encoding run on blocking threads.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::backend::Encoder;
use crate::model::{InitError, ModelGuard};
use crate::params::{GenerationParams, GenerationRequest, ParamError};

pub const PROGRESS_STARTED: f64 = 0.1;
pub const PROGRESS_SAMPLED: f64 = 0.8;
pub const PROGRESS_DONE: f64 = 1.0;

pub const DEFAULT_LIST_LIMIT: usize = 50;
pub const MAX_LIST_LIMIT: usize = 100;

const ARTIFACT_EXTENSION: &str = "mp4";
const PARTIAL_SUFFIX: &str = "part";

fn artifact_name(job_id: &str) -> String {
    format!("{job_id}.{ARTIFACT_EXTENSION}")
}

fn partial_name(job_id: &str) -> String {
    format!("{job_id}.{ARTIFACT_EXTENSION}.{PARTIAL_SUFFIX}")
}

/// Remove `path`, treating an already missing file as success.
fn remove_if_present(job_id: &str, path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
        Err(err) => {
            warn!(job_id, path = %path.display(), error = %err, "Failed to remove artifact");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    Processing,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Processing => "processing",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Completed | JobStatus::Failed)
    }

    /// Allowed moves: queued -> processing -> completed | failed.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        matches!(
            (self, next),
            (JobStatus::Queued, JobStatus::Processing)
                | (JobStatus::Processing, JobStatus::Completed)
                | (JobStatus::Processing, JobStatus::Failed)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "queued" => Ok(JobStatus::Queued),
            "processing" => Ok(JobStatus::Processing),
            "completed" => Ok(JobStatus::Completed),
            "failed" => Ok(JobStatus::Failed),
            other => Err(format!(
                "unknown job status '{other}' (expected one of: queued, processing, completed, failed)"
            )),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: String,
    pub status: JobStatus,
    pub progress: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub params: GenerationParams,
    /// Artifact file name inside the output directory. Set only when completed.
    pub artifact: Option<String>,
    /// Set only when failed.
    pub error: Option<String>,
    pub estimated_seconds: u32,
    #[serde(skip)]
    seq: u64,
}

impl JobRecord {
    fn new(id: String, params: GenerationParams, seq: u64) -> Self {
        let now = Utc::now();
        Self {
            id,
            status: JobStatus::Queued,
            progress: 0.0,
            created_at: now,
            updated_at: now,
            estimated_seconds: params.estimated_seconds(),
            params,
            artifact: None,
            error: None,
            seq,
        }
    }

    fn transition(&mut self, next: JobStatus) -> bool {
        if !self.status.can_transition_to(next) {
            return false;
        }
        self.status = next;
        self.updated_at = Utc::now();
        true
    }

    fn advance(&mut self, progress: f64) {
        if self.status.is_terminal() {
            return;
        }
        if progress > self.progress {
            self.progress = progress.min(PROGRESS_DONE);
            self.updated_at = Utc::now();
        }
    }

    fn begin(&mut self) -> bool {
        if !self.transition(JobStatus::Processing) {
            return false;
        }
        self.advance(PROGRESS_STARTED);
        true
    }

    fn complete(&mut self, artifact: String) {
        self.advance(PROGRESS_DONE);
        if self.transition(JobStatus::Completed) {
            self.artifact = Some(artifact);
        }
    }

    fn fail(&mut self, reason: String) {
        if self.transition(JobStatus::Failed) {
            self.error = Some(reason);
        }
    }

    /// Public URL of the artifact, once the job has completed.
    pub fn video_url(&self) -> Option<String> {
        self.artifact
            .as_ref()
            .map(|name| format!("/api/videos/{name}"))
    }
}

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Invalid(#[from] ParamError),
    #[error("job not found: {0}")]
    NotFound(String),
    #[error("job {0} is processing and cannot be deleted")]
    Conflict(String),
    #[error(transparent)]
    BackendUnavailable(#[from] InitError),
}

#[derive(Clone)]
pub struct JobRegistry {
    inner: Arc<RegistryInner>,
}

struct RegistryInner {
    jobs: DashMap<String, JobRecord>,
    next_seq: AtomicU64,
    dispatch_tx: mpsc::UnboundedSender<String>,
    worker_slots: Arc<Semaphore>,
    pool_size: usize,
    model: Arc<ModelGuard>,
    encoder: Arc<dyn Encoder>,
    output_dir: PathBuf,
}

impl JobRegistry {
    /// Build the registry and start its dispatcher.
    ///
    /// Must be called from within a Tokio runtime. The output directory is
    /// created here, independently of model readiness.
    pub fn new(
        model: Arc<ModelGuard>,
        encoder: Arc<dyn Encoder>,
        output_dir: PathBuf,
        pool_size: usize,
    ) -> Result<Self> {
        std::fs::create_dir_all(&output_dir).with_context(|| {
            format!("failed to create output directory: {}", output_dir.display())
        })?;

        let pool_size = pool_size.max(1);
        let (dispatch_tx, dispatch_rx) = mpsc::unbounded_channel();
        let worker_slots = Arc::new(Semaphore::new(pool_size));

        let inner = Arc::new(RegistryInner {
            jobs: DashMap::new(),
            next_seq: AtomicU64::new(0),
            dispatch_tx,
            worker_slots: Arc::clone(&worker_slots),
            pool_size,
            model,
            encoder,
            output_dir,
        });

        tokio::spawn(dispatch_loop(
            Arc::downgrade(&inner),
            worker_slots,
            dispatch_rx,
        ));

        Ok(Self { inner })
    }

    pub fn model(&self) -> &Arc<ModelGuard> {
        &self.inner.model
    }

    pub fn output_dir(&self) -> &Path {
        &self.inner.output_dir
    }

    pub fn pool_size(&self) -> usize {
        self.inner.pool_size
    }

    /// Worker slots currently held by running jobs.
    pub fn busy_workers(&self) -> usize {
        self.inner
            .pool_size
            .saturating_sub(self.inner.worker_slots.available_permits())
    }

    /// Validate, register and enqueue a request. Returns the queued record.
    ///
    /// Never waits for the model; only a permanently failed model rejects.
    pub fn submit(&self, request: &GenerationRequest) -> Result<JobRecord, RegistryError> {
        let params = request.resolve()?;

        if let Some(err) = self.inner.model.failure() {
            return Err(RegistryError::BackendUnavailable(err));
        }

        let id = Uuid::new_v4().to_string();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed);
        let record = JobRecord::new(id.clone(), params, seq);
        self.inner.jobs.insert(id.clone(), record.clone());

        if self.inner.dispatch_tx.send(id.clone()).is_err() {
            self.inner.jobs.remove(&id);
            return Err(RegistryError::BackendUnavailable(InitError {
                reason: "job dispatcher is not running".to_string(),
            }));
        }

        info!(
            job_id = %id,
            width = record.params.width,
            height = record.params.height,
            video_length = record.params.video_length,
            steps = record.params.num_inference_steps,
            preset = ?record.params.preset,
            "Job queued"
        );

        Ok(record)
    }

    pub fn status(&self, job_id: &str) -> Result<JobRecord, RegistryError> {
        self.inner
            .jobs
            .get(job_id)
            .map(|job| job.clone())
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))
    }

    /// Newest first, optionally filtered by status, truncated to `limit`
    /// (clamped to `1..=MAX_LIST_LIMIT`).
    pub fn list(&self, filter: Option<JobStatus>, limit: usize) -> Vec<JobRecord> {
        let limit = limit.clamp(1, MAX_LIST_LIMIT);
        let mut jobs: Vec<JobRecord> = self
            .inner
            .jobs
            .iter()
            .filter(|entry| filter.map_or(true, |status| entry.status == status))
            .map(|entry| entry.value().clone())
            .collect();

        jobs.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| b.seq.cmp(&a.seq))
        });
        jobs.truncate(limit);
        jobs
    }

    /// Remove a record and its artifact. Processing jobs are refused.
    pub fn delete(&self, job_id: &str) -> Result<(), RegistryError> {
        let removed = self
            .inner
            .jobs
            .remove_if(job_id, |_, job| job.status != JobStatus::Processing);

        let Some((_, job)) = removed else {
            return Err(if self.inner.jobs.contains_key(job_id) {
                RegistryError::Conflict(job_id.to_string())
            } else {
                RegistryError::NotFound(job_id.to_string())
            });
        };

        // Failed jobs never own an artifact but may have left a partial encode.
        let mut names = vec![artifact_name(&job.id), partial_name(&job.id)];
        if let Some(artifact) = &job.artifact {
            if !names.contains(artifact) {
                names.push(artifact.clone());
            }
        }
        for name in names {
            remove_if_present(job_id, &self.inner.output_dir.join(name));
        }

        info!(job_id, status = %job.status, "Job deleted");
        Ok(())
    }

    /// Resolve an artifact file name to its path, but only when a completed
    /// job owns it.
    ///
    /// Names that could escape the directory are rejected as not found.
    pub fn artifact_path(&self, filename: &str) -> Option<PathBuf> {
        if filename.is_empty()
            || filename.contains('/')
            || filename.contains('\\')
            || filename.contains("..")
        {
            return None;
        }
        let job_id = filename.strip_suffix(&format!(".{ARTIFACT_EXTENSION}"))?;
        let job = self.inner.jobs.get(job_id)?;
        if job.status != JobStatus::Completed || job.artifact.as_deref() != Some(filename) {
            return None;
        }
        Some(self.inner.output_dir.join(filename))
    }

    pub fn active_count(&self) -> usize {
        self.inner
            .jobs
            .iter()
            .filter(|job| matches!(job.status, JobStatus::Queued | JobStatus::Processing))
            .count()
    }

    pub fn total_count(&self) -> usize {
        self.inner.jobs.len()
    }
}

async fn dispatch_loop(
    registry: Weak<RegistryInner>,
    worker_slots: Arc<Semaphore>,
    mut dispatch_rx: mpsc::UnboundedReceiver<String>,
) {
    while let Some(job_id) = dispatch_rx.recv().await {
        let permit = match Arc::clone(&worker_slots).acquire_owned().await {
            Ok(permit) => permit,
            Err(_) => break,
        };
        let Some(inner) = registry.upgrade() else {
            break;
        };
        tokio::spawn(run_job(JobRegistry { inner }, job_id, permit));
    }
}

/// Execute one job while holding its worker slot.
async fn run_job(registry: JobRegistry, job_id: String, _permit: OwnedSemaphorePermit) {
    let params = {
        let Some(mut job) = registry.inner.jobs.get_mut(&job_id) else {
            // Deleted while queued.
            return;
        };
        if !job.begin() {
            return;
        }
        job.params.clone()
    };
    info!(job_id = %job_id, "Job processing");

    match execute(&registry, &job_id, params).await {
        Ok(artifact) => {
            if let Some(mut job) = registry.inner.jobs.get_mut(&job_id) {
                job.complete(artifact);
            }
            info!(job_id = %job_id, "Job completed");
        }
        Err(err) => {
            let reason = format!("{err:#}");
            error!(job_id = %job_id, error = %reason, "Job failed");
            if let Some(mut job) = registry.inner.jobs.get_mut(&job_id) {
                job.fail(reason);
            }
        }
    }
}

async fn execute(registry: &JobRegistry, job_id: &str, params: GenerationParams) -> Result<String> {
    let model = Arc::clone(&registry.inner.model);
    let sample_params = params.clone();
    let frames = tokio::task::spawn_blocking(move || {
        let sampler = model.ensure_ready()?;
        sampler.predict(&sample_params)
    })
    .await
    .context("sampler task panicked")?
    .context("video generation failed")?;

    if let Some(mut job) = registry.inner.jobs.get_mut(job_id) {
        job.advance(PROGRESS_SAMPLED);
    }

    // Encode under a partial name so the final name only ever holds a
    // finished video.
    let artifact = artifact_name(job_id);
    let final_path = registry.inner.output_dir.join(&artifact);
    let partial_path = registry.inner.output_dir.join(partial_name(job_id));
    let encoder = Arc::clone(&registry.inner.encoder);
    let fps = params.fps;
    let encode_path = partial_path.clone();
    let encoded = tokio::task::spawn_blocking(move || encoder.encode(&frames, fps, &encode_path))
        .await
        .context("encoder task panicked")
        .and_then(|result| result.context("video encoding failed"))
        .and_then(|()| {
            std::fs::rename(&partial_path, &final_path).with_context(|| {
                format!("failed to move encoded video to {}", final_path.display())
            })
        });

    if let Err(err) = encoded {
        remove_if_present(job_id, &partial_path);
        return Err(err);
    }
    Ok(artifact)
}
