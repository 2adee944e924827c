//! Jobs: observable, cancellable pipeline runs.
//!
//! Each job owns its event log. Events are numbered from 1 under the job's
//! lock, appended to `events.jsonl`, and broadcast to live subscribers. Once
//! a terminal event is in the log, the job accepts nothing further, so a
//! cancelled pipeline cannot sneak a late `phase_start` in.
//!
//! File writes happen off the lock: `emit` queues them in sequence order to
//! the job's writer task, which applies them on the blocking pool.
//!
//! A project holds at most one job at a time. The claim is released when
//! the job's task ends, not at its terminal event, so a cancelled pipeline
//! that is still winding down keeps the project.

pub mod api;
pub mod server;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;

use forgeline_common::{HumanDecision, JobEvent, JobRecord, JobStatus, PipelineEvent};

use crate::config::{ForgelineToml, ProjectPaths};
use crate::errors::JobError;
use crate::escalation::human::{awaiting_decision, submit_decision};
use crate::orchestrator::{EventSink, PipelineOrchestrator, RunOptions, RunOutcome};
use crate::util::write_atomic;

const JOB_FILE: &str = "job.json";
const EVENTS_FILE: &str = "events.jsonl";

/// Starts a pipeline for a job. The default runs [`PipelineOrchestrator`]
/// with the project's own configuration.
#[async_trait]
pub trait PipelineLauncher: Send + Sync {
    async fn launch(
        &self,
        project: &Path,
        options: RunOptions,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome>;

    /// Heartbeat interval for jobs on `project`, when the project sets one.
    fn heartbeat(&self, _project: &Path) -> Option<Duration> {
        None
    }
}

pub struct OrchestratorLauncher;

#[async_trait]
impl PipelineLauncher for OrchestratorLauncher {
    async fn launch(
        &self,
        project: &Path,
        options: RunOptions,
        sink: Arc<dyn EventSink>,
        cancel: CancellationToken,
    ) -> Result<RunOutcome> {
        let config = ForgelineToml::resolve(&ProjectPaths::new(project))?;
        PipelineOrchestrator::new(project, config)
            .with_sink(sink)
            .run(options, cancel)
            .await
    }

    fn heartbeat(&self, project: &Path) -> Option<Duration> {
        match ForgelineToml::resolve(&ProjectPaths::new(project)) {
            Ok(config) => Some(config.heartbeat_interval()),
            Err(e) => {
                tracing::debug!(project = %project.display(), error = %format!("{:#}", e), "No heartbeat from project config");
                None
            }
        }
    }
}

struct JobState {
    record: JobRecord,
    events: Vec<JobEvent>,
    /// Set once a terminal event is logged.
    closed: bool,
}

/// Pending file work for a job's writer task.
enum LogWrite {
    Event { event: JobEvent, record: JobRecord },
    Record(JobRecord),
    Flush(oneshot::Sender<()>),
}

pub struct Job {
    state: Mutex<JobState>,
    tx: broadcast::Sender<JobEvent>,
    writer: mpsc::UnboundedSender<LogWrite>,
    cancel: CancellationToken,
}

impl Job {
    /// Must be called inside a tokio runtime: it spawns the writer task.
    fn new(record: JobRecord, events: Vec<JobEvent>, dir: PathBuf) -> Self {
        let (tx, _) = broadcast::channel(256);
        let (writer, queue) = mpsc::unbounded_channel();
        tokio::spawn(write_log(dir, queue));
        let closed = record.status.is_terminal();
        Self {
            state: Mutex::new(JobState {
                record,
                events,
                closed,
            }),
            tx,
            writer,
            cancel: CancellationToken::new(),
        }
    }

    pub fn record(&self) -> JobRecord {
        self.lock().record.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn events_after(&self, after: u64) -> Vec<JobEvent> {
        self.lock()
            .events
            .iter()
            .filter(|e| e.seq > after)
            .cloned()
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, JobState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Log an event. Returns `false` when the job is already closed.
    pub fn emit(&self, event: PipelineEvent) -> bool {
        let mut state = self.lock();
        if state.closed {
            tracing::debug!(job = %state.record.id, event = event.name(), "Event rejected after close");
            return false;
        }

        let seq = state.events.len() as u64 + 1;
        let now = Utc::now();
        match &event {
            PipelineEvent::JobStarted { .. } => {
                state.record.status = JobStatus::Running;
                state.record.started_at = Some(now);
            }
            PipelineEvent::PhaseStart { phase_id } => {
                state.record.current_phase = Some(phase_id.clone());
            }
            PipelineEvent::ProjectComplete { .. } => state.record.status = JobStatus::Completed,
            PipelineEvent::JobFailed { error } => {
                state.record.status = JobStatus::Failed;
                state.record.error = Some(error.clone());
            }
            PipelineEvent::JobCancelled => state.record.status = JobStatus::Cancelled,
            _ => {}
        }
        if event.is_terminal() {
            state.closed = true;
            state.record.finished_at = Some(now);
        }
        state.record.last_seq = seq;

        let job_event = JobEvent {
            seq,
            timestamp: now,
            event,
        };
        // Queued under the lock so the writer sees events in seq order.
        self.queue(LogWrite::Event {
            event: job_event.clone(),
            record: state.record.clone(),
        });
        state.events.push(job_event.clone());
        // No receivers is fine.
        let _ = self.tx.send(job_event);
        true
    }

    fn persist(&self) {
        self.queue(LogWrite::Record(self.record()));
    }

    fn queue(&self, write: LogWrite) {
        if self.writer.send(write).is_err() {
            tracing::warn!("Job writer is gone; dropping a log write");
        }
    }

    /// Wait until every write queued so far is on disk.
    pub async fn flush(&self) {
        let (done, written) = oneshot::channel();
        self.queue(LogWrite::Flush(done));
        let _ = written.await;
    }
}

/// Applies a job's queued writes in order. Each batch runs on the blocking
/// pool; the loop ends once the job is dropped and the queue drained.
async fn write_log(dir: PathBuf, mut queue: mpsc::UnboundedReceiver<LogWrite>) {
    let mut batch = Vec::new();
    while queue.recv_many(&mut batch, 64).await > 0 {
        let writes = std::mem::take(&mut batch);
        let dir = dir.clone();
        match tokio::task::spawn_blocking(move || write_batch(&dir, writes)).await {
            Ok(flushed) => {
                for done in flushed {
                    let _ = done.send(());
                }
            }
            Err(e) => tracing::warn!(error = %e, "Job writer batch panicked"),
        }
    }
}

/// Append the batch's events, then write the newest record once. Returns
/// the flush waiters to release.
fn write_batch(dir: &Path, writes: Vec<LogWrite>) -> Vec<oneshot::Sender<()>> {
    let mut events = Vec::new();
    let mut latest = None;
    let mut flushed = Vec::new();
    for write in writes {
        match write {
            LogWrite::Event { event, record } => {
                events.push(event);
                latest = Some(record);
            }
            LogWrite::Record(record) => latest = Some(record),
            LogWrite::Flush(done) => flushed.push(done),
        }
    }
    if !events.is_empty()
        && let Err(e) = append_events(&dir.join(EVENTS_FILE), &events)
    {
        tracing::warn!(dir = %dir.display(), error = %format!("{:#}", e), "Failed to append events");
    }
    if let Some(record) = latest
        && let Err(e) = write_record(&dir.join(JOB_FILE), &record)
    {
        tracing::warn!(job = %record.id, error = %format!("{:#}", e), "Failed to write job record");
    }
    flushed
}

fn append_events(path: &Path, events: &[JobEvent]) -> Result<()> {
    let mut file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;
    for event in events {
        let line = serde_json::to_string(event).context("Failed to serialize event")?;
        writeln!(file, "{}", line).with_context(|| format!("Failed to write {}", path.display()))?;
    }
    Ok(())
}

fn write_record(path: &Path, record: &JobRecord) -> Result<()> {
    let json = serde_json::to_vec_pretty(record).context("Failed to serialize job")?;
    write_atomic(path, &json).with_context(|| format!("Failed to write {}", path.display()))
}

/// Routes pipeline events into a job's log.
struct JobSink(Arc<Job>);

impl EventSink for JobSink {
    fn emit(&self, event: PipelineEvent) -> bool {
        self.0.emit(event)
    }
}

/// Canonical project path to the id of the job running on it.
type ActiveProjects = Arc<Mutex<HashMap<PathBuf, String>>>;

/// A project claimed by one job; dropping it frees the project.
struct ProjectLease {
    active: ActiveProjects,
    project: PathBuf,
}

impl Drop for ProjectLease {
    fn drop(&mut self) {
        self.active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(&self.project);
    }
}

pub struct JobManager {
    jobs: RwLock<HashMap<String, Arc<Job>>>,
    active: ActiveProjects,
    jobs_dir: PathBuf,
    launcher: Arc<dyn PipelineLauncher>,
    /// Used when the launcher has no interval for the project.
    heartbeat: Duration,
}

impl JobManager {
    pub fn new(jobs_dir: &Path, launcher: Arc<dyn PipelineLauncher>, heartbeat: Duration) -> Self {
        Self {
            jobs: RwLock::new(HashMap::new()),
            active: Arc::new(Mutex::new(HashMap::new())),
            jobs_dir: jobs_dir.to_path_buf(),
            launcher,
            heartbeat,
        }
    }

    fn claim(&self, project: &Path, id: &str) -> Result<ProjectLease, JobError> {
        let mut active = self
            .active
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        if let Some(job) = active.get(project) {
            return Err(JobError::ProjectBusy {
                path: project.to_path_buf(),
                job: job.clone(),
            });
        }
        active.insert(project.to_path_buf(), id.to_string());
        Ok(ProjectLease {
            active: self.active.clone(),
            project: project.to_path_buf(),
        })
    }

    fn get(&self, id: &str) -> Result<Arc<Job>, JobError> {
        self.jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound { id: id.to_string() })
    }

    /// Reload jobs persisted by an earlier server. Jobs that were still
    /// running are marked failed: their task died with that process.
    pub fn load_existing(&self) -> Result<usize> {
        if !self.jobs_dir.exists() {
            return Ok(0);
        }
        let mut loaded = 0;
        let entries = std::fs::read_dir(&self.jobs_dir)
            .with_context(|| format!("Failed to read {}", self.jobs_dir.display()))?;
        for entry in entries.flatten() {
            let dir = entry.path();
            let Ok(content) = std::fs::read_to_string(dir.join(JOB_FILE)) else {
                continue;
            };
            let mut record: JobRecord = match serde_json::from_str(&content) {
                Ok(record) => record,
                Err(e) => {
                    tracing::warn!(dir = %dir.display(), error = %e, "Skipping unreadable job record");
                    continue;
                }
            };
            let events = read_events(&dir.join(EVENTS_FILE));
            let interrupted = !record.status.is_terminal();
            if interrupted {
                record.status = JobStatus::Failed;
                record.error = Some("interrupted by server shutdown".to_string());
                record.finished_at = Some(Utc::now());
            }
            let job = Job::new(record, events, dir);
            if interrupted {
                job.persist();
            }
            let id = job.record().id;
            self.jobs
                .write()
                .unwrap_or_else(|poisoned| poisoned.into_inner())
                .insert(id, Arc::new(job));
            loaded += 1;
        }
        tracing::info!(jobs = loaded, "Loaded existing jobs");
        Ok(loaded)
    }

    pub fn submit(&self, project: &Path, options: RunOptions) -> Result<JobRecord, JobError> {
        if !project.is_dir() {
            return Err(JobError::InvalidProject {
                path: project.to_path_buf(),
            });
        }
        let project = project
            .canonicalize()
            .with_context(|| format!("Failed to resolve {}", project.display()))?;

        let id = uuid::Uuid::new_v4().to_string();
        let lease = self.claim(&project, &id)?;
        let dir = self.jobs_dir.join(&id);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create job dir: {}", dir.display()))?;

        let record = JobRecord::new(&id, project.clone());
        let job = Arc::new(Job::new(record, Vec::new(), dir));
        self.jobs
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(id.clone(), job.clone());

        job.emit(PipelineEvent::JobStarted {
            project: project.clone(),
        });
        tracing::info!(job = %id, project = %project.display(), "Job submitted");

        let launcher = self.launcher.clone();
        let fallback_heartbeat = self.heartbeat;
        let task_job = job.clone();
        tokio::spawn(async move {
            let _lease = lease;
            let job = task_job;
            let heartbeat = launcher.heartbeat(&project).unwrap_or(fallback_heartbeat);
            let beats = tokio::spawn(heartbeats(job.clone(), heartbeat));
            let sink: Arc<dyn EventSink> = Arc::new(JobSink(job.clone()));

            let result = launcher
                .launch(&project, options, sink, job.cancel.clone())
                .await;
            beats.abort();

            match result {
                Ok(outcome) => tracing::info!(job = %job.record().id, outcome = ?outcome, "Job finished"),
                Err(e) => {
                    tracing::error!(job = %job.record().id, error = %format!("{:#}", e), "Job failed");
                    job.emit(PipelineEvent::JobFailed {
                        error: format!("{:#}", e),
                    });
                }
            }
            if !job.is_closed() {
                job.emit(PipelineEvent::JobFailed {
                    error: "pipeline ended without a terminal event".to_string(),
                });
            }
        });

        Ok(job.record())
    }

    pub fn cancel(&self, id: &str) -> Result<JobRecord, JobError> {
        let job = self.get(id)?;
        let record = job.record();
        if record.status.is_terminal() {
            return Err(JobError::AlreadyTerminal {
                id: id.to_string(),
                status: record.status,
            });
        }
        job.cancel.cancel();
        job.emit(PipelineEvent::JobCancelled);
        tracing::info!(job = %id, "Job cancelled");
        Ok(job.record())
    }

    pub fn list(&self) -> Vec<JobRecord> {
        let mut records: Vec<JobRecord> = self
            .jobs
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .map(|job| job.record())
            .collect();
        records.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        records
    }

    pub fn status(&self, id: &str) -> Result<JobRecord, JobError> {
        Ok(self.get(id)?.record())
    }

    pub fn events_since(&self, id: &str, after: u64) -> Result<Vec<JobEvent>, JobError> {
        Ok(self.get(id)?.events_after(after))
    }

    /// Live event stream starting after `after`: the logged backlog first,
    /// then new events as they are emitted, ending with the terminal event.
    pub fn subscribe(&self, id: &str, after: u64) -> Result<ReceiverStream<JobEvent>, JobError> {
        let job = self.get(id)?;
        let (backlog, mut rx, closed) = {
            let state = job.lock();
            let backlog: Vec<JobEvent> = state.events.iter().filter(|e| e.seq > after).cloned().collect();
            (backlog, job.tx.subscribe(), state.closed)
        };

        let (out, stream) = mpsc::channel(64);
        tokio::spawn(async move {
            let mut last = after;
            for event in backlog {
                if !forward(&out, &mut last, event).await {
                    return;
                }
            }
            if closed {
                return;
            }
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if !forward(&out, &mut last, event).await {
                            return;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::debug!(skipped, "Subscriber lagged; replaying from log");
                        for event in job.events_after(last) {
                            if !forward(&out, &mut last, event).await {
                                return;
                            }
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => return,
                }
            }
        });
        Ok(ReceiverStream::new(stream))
    }

    /// Write a human decision for a phase of this job's project.
    pub fn decide(&self, id: &str, phase: &str, decision: &HumanDecision) -> Result<PathBuf, JobError> {
        let job = self.get(id)?;
        let dir = ProjectPaths::new(&job.record().project).escalation_dir(phase);
        if !awaiting_decision(&dir) {
            return Err(JobError::NotAwaitingDecision {
                id: id.to_string(),
                phase: phase.to_string(),
            });
        }
        Ok(submit_decision(&dir, decision)?)
    }
}

/// Send one event unless already delivered. `false` ends the forwarder:
/// the subscriber went away or the job is done.
async fn forward(out: &mpsc::Sender<JobEvent>, last: &mut u64, event: JobEvent) -> bool {
    if event.seq <= *last {
        return true;
    }
    *last = event.seq;
    let terminal = event.event.is_terminal();
    out.send(event).await.is_ok() && !terminal
}

async fn heartbeats(job: Arc<Job>, every: Duration) {
    let started = Instant::now();
    let mut ticker = tokio::time::interval(every);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let phase_id = job.record().current_phase;
        if !job.emit(PipelineEvent::Heartbeat {
            phase_id,
            elapsed_secs: started.elapsed().as_secs(),
        }) {
            return;
        }
    }
}

fn read_events(path: &Path) -> Vec<JobEvent> {
    let Ok(content) = std::fs::read_to_string(path) else {
        return Vec::new();
    };
    content
        .lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| serde_json::from_str(l).ok())
        .collect()
}
