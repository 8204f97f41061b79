// src/job.rs - Job streaming with per-line acknowledgment
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::communication::commands::RealtimeCommand;
use crate::communication::event_system::EventBus;
use crate::communication::frame::Ack;
use crate::communication::serial::{Link, LinkError, PendingAck};
use crate::communication::status::{MachineState, MachineStatus};
use crate::gcode::parser::program_lines;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Idle,
    Running,
    Paused,
    /// Reported once when a job is stopped; the streamer then returns to `Idle`.
    Stopped,
}

#[derive(Debug, Error)]
pub enum JobError {
    #[error("a job is already active")]
    AlreadyRunning,
    #[error("no job is running")]
    NotRunning,
    #[error("job is not paused")]
    NotPaused,
    #[error("program contains no commands")]
    Empty,
    #[error(transparent)]
    Link(#[from] LinkError),
}

/// Lines acknowledged so far out of the job's total.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobProgress {
    pub cursor: usize,
    pub total: usize,
}

impl JobProgress {
    pub fn fraction(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.cursor as f64 / self.total as f64
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum JobEvent {
    Started { id: String, total: usize },
    StateChanged(JobState),
    Progress(JobProgress),
    /// The controller answered `error:N` to line `line` (zero-based); streaming continues.
    LineError { line: usize, code: u16 },
    /// Transmission problem; the job is paused.
    Failed(String),
    Completed { total: usize },
    /// The link closed, or the controller was reset, under an active job.
    Aborted,
}

/// The job being streamed.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub lines: Arc<Vec<String>>,
}

#[derive(Debug, Clone, Default)]
pub struct StreamerOptions {
    /// Pause the job when an acknowledgment takes longer than this.
    pub ack_timeout: Option<Duration>,
}

struct StreamerInner {
    link: Link,
    options: StreamerOptions,
    state: watch::Sender<JobState>,
    progress: watch::Sender<JobProgress>,
    events: EventBus<JobEvent>,
    job: Mutex<Option<Job>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

/// Streams G-code jobs to the controller one acknowledged line at a time.
#[derive(Clone)]
pub struct JobStreamer {
    inner: Arc<StreamerInner>,
}

impl JobStreamer {
    pub fn new(link: Link, options: StreamerOptions) -> Self {
        let (state, _) = watch::channel(JobState::Idle);
        let (progress, _) = watch::channel(JobProgress::default());
        Self {
            inner: Arc::new(StreamerInner {
                link,
                options,
                state,
                progress,
                events: EventBus::new(EVENT_CAPACITY),
                job: Mutex::new(None),
                task: Mutex::new(None),
            }),
        }
    }

    pub fn link(&self) -> &Link {
        &self.inner.link
    }

    pub fn state(&self) -> JobState {
        *self.inner.state.borrow()
    }

    pub fn progress(&self) -> JobProgress {
        *self.inner.progress.borrow()
    }

    pub async fn current_job(&self) -> Option<Job> {
        self.inner.job.lock().await.clone()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.inner.events.subscribe()
    }

    /// Poll `?` every `interval` for as long as the link stays open.
    pub async fn start_status_polling(&self, interval: Duration) -> Result<(), LinkError> {
        let handle = spawn_status_poller(self.inner.link.clone(), interval);
        self.inner.link.attach_task(handle.abort_handle()).await
    }

    /// Start streaming `program`. Comment and blank lines are not sent.
    pub async fn start(&self, program: &str) -> Result<String, JobError> {
        let mut task = self.inner.task.lock().await;
        if self.state() != JobState::Idle {
            return Err(JobError::AlreadyRunning);
        }
        let lines = program_lines(program);
        if lines.is_empty() {
            return Err(JobError::Empty);
        }
        if !self.inner.link.is_open().await {
            return Err(JobError::Link(LinkError::NotConnected));
        }

        let job = Job {
            id: uuid::Uuid::new_v4().to_string(),
            lines: Arc::new(lines),
        };
        let total = job.lines.len();
        tracing::info!("Starting job {} with {} lines", job.id, total);

        *self.inner.job.lock().await = Some(job.clone());
        self.inner.progress.send_replace(JobProgress { cursor: 0, total });
        self.inner.set_state(JobState::Running);
        self.inner.events.publish(JobEvent::Started { id: job.id.clone(), total });

        *task = Some(tokio::spawn(run_job(self.inner.clone(), job.lines.clone())));
        Ok(job.id)
    }

    /// Feed hold. The line in flight still completes; nothing new is sent.
    pub async fn pause(&self) -> Result<(), JobError> {
        let _task = self.inner.task.lock().await;
        if self.state() != JobState::Running {
            return Err(JobError::NotRunning);
        }
        self.inner.set_state(JobState::Paused);
        self.inner.link.write_realtime(RealtimeCommand::FeedHold).await?;
        tracing::info!("Job paused at line {}", self.progress().cursor);
        Ok(())
    }

    /// Cycle start. Streaming continues from the unchanged cursor.
    pub async fn resume(&self) -> Result<(), JobError> {
        let _task = self.inner.task.lock().await;
        if self.state() != JobState::Paused {
            return Err(JobError::NotPaused);
        }
        self.inner.link.write_realtime(RealtimeCommand::CycleStart).await?;
        self.inner.set_state(JobState::Running);
        tracing::info!("Job resumed at line {}", self.progress().cursor);
        Ok(())
    }

    /// Soft reset and discard the rest of the job. The machine usually needs
    /// re-homing before the next job.
    pub async fn stop(&self) -> Result<(), JobError> {
        let mut task = self.inner.task.lock().await;
        if !matches!(self.state(), JobState::Running | JobState::Paused) {
            return Err(JobError::NotRunning);
        }
        if let Some(handle) = task.take() {
            handle.abort();
        }
        let reset = self.inner.link.write_realtime(RealtimeCommand::SoftReset).await;
        self.inner.finish(JobState::Stopped).await;
        tracing::info!("Job stopped");
        reset.map_err(JobError::from)
    }

    /// Wait until the streamer is idle again.
    pub async fn wait(&self) {
        let mut state = self.inner.state.subscribe();
        let _ = state.wait_for(|s| *s == JobState::Idle).await;
    }
}

impl StreamerInner {
    fn set_state(&self, state: JobState) {
        let changed = self.state.send_if_modified(|current| {
            let changed = *current != state;
            *current = state;
            changed
        });
        if changed {
            self.events.publish(JobEvent::StateChanged(state));
        }
    }

    /// Drop the job and return to `Idle`, reporting `reason` first when it is not `Idle`.
    async fn finish(&self, reason: JobState) {
        *self.job.lock().await = None;
        self.progress.send_replace(JobProgress::default());
        if reason != JobState::Idle {
            self.events.publish(JobEvent::StateChanged(reason));
        }
        self.set_state(JobState::Idle);
    }

    fn report_progress(&self, cursor: usize, total: usize) {
        let progress = JobProgress { cursor, total };
        self.progress.send_replace(progress);
        self.events.publish(JobEvent::Progress(progress));
    }

    fn fail(&self, reason: String) {
        tracing::error!("Job paused after failure: {}", reason);
        self.set_state(JobState::Paused);
        self.events.publish(JobEvent::Failed(reason));
    }
}

enum AckOutcome {
    Acked(Ack),
    Stopped,
    Disconnected,
}

enum Hold {
    Run,
    Stop,
    Disconnected,
}

/// Send/ack loop of one job.
async fn run_job(inner: Arc<StreamerInner>, lines: Arc<Vec<String>>) {
    let mut state = inner.state.subscribe();
    let mut status = inner.link.watch_status();
    let total = lines.len();
    let mut cursor = 0;

    while cursor < total {
        // Hold here while paused. A link that closes meanwhile ends the job.
        let hold = tokio::select! {
            held = state.wait_for(|s| matches!(s, JobState::Running | JobState::Idle)) => match held {
                Ok(s) if *s == JobState::Running => Hold::Run,
                _ => Hold::Stop,
            },
            _ = wait_disconnected(&mut status) => Hold::Disconnected,
        };
        match hold {
            Hold::Run => {}
            Hold::Stop => return,
            Hold::Disconnected => {
                abort(&inner).await;
                return;
            }
        }

        let pending = match inner.link.write_acked(&lines[cursor]).await {
            Ok(pending) => pending,
            Err(LinkError::NotConnected) => {
                abort(&inner).await;
                return;
            }
            Err(e) => {
                // Nothing reached the controller; the same line is sent again on resume.
                inner.fail(format!("line {}: {}", cursor + 1, e));
                continue;
            }
        };

        match wait_for_ack(&inner, pending, &mut state, cursor).await {
            AckOutcome::Acked(ack) => {
                if let Ack::Error(code) = ack {
                    tracing::warn!("Line {} '{}' rejected with error:{}", cursor + 1, lines[cursor], code);
                    inner.events.publish(JobEvent::LineError { line: cursor, code });
                }
                cursor += 1;
                inner.report_progress(cursor, total);
            }
            AckOutcome::Stopped => return,
            AckOutcome::Disconnected => {
                abort(&inner).await;
                return;
            }
        }
    }

    tracing::info!("Job complete, {} lines acknowledged", total);
    inner.events.publish(JobEvent::Completed { total });
    inner.finish(JobState::Idle).await;
}

async fn wait_disconnected(status: &mut watch::Receiver<MachineStatus>) {
    // A dropped sender means the link itself is gone.
    let _ = status.wait_for(|s| s.state == MachineState::Disconnected).await;
}

/// Wait for the answer to the job's own line; other writers' acks never land here.
async fn wait_for_ack(
    inner: &StreamerInner,
    pending: PendingAck,
    state: &mut watch::Receiver<JobState>,
    cursor: usize,
) -> AckOutcome {
    let mut deadline = inner.options.ack_timeout.map(|t| Instant::now() + t);
    let received = pending.received();
    tokio::pin!(received);
    loop {
        tokio::select! {
            ack = &mut received => {
                return match ack {
                    Ok(ack) => AckOutcome::Acked(ack),
                    Err(_) => AckOutcome::Disconnected,
                };
            }
            changed = state.changed() => {
                if changed.is_err() || *state.borrow() == JobState::Idle {
                    return AckOutcome::Stopped;
                }
            }
            _ = tokio::time::sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {
                // Report once and keep waiting; resending could run the line twice.
                deadline = None;
                inner.fail(format!("no acknowledgment for line {}", cursor + 1));
            }
        }
    }
}

async fn abort(inner: &StreamerInner) {
    tracing::warn!("Link closed or controller reset during job, aborting");
    inner.events.publish(JobEvent::Aborted);
    inner.finish(JobState::Idle).await;
}

/// Send a status query every `interval` until the link closes.
pub fn spawn_status_poller(link: Link, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match link.write_realtime(RealtimeCommand::StatusQuery).await {
                Ok(()) => {}
                Err(LinkError::NotConnected) => {
                    tracing::debug!("Status poller stopping, link closed");
                    break;
                }
                Err(e) => tracing::warn!("Status query failed: {}", e),
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_progress_fraction() {
        assert_eq!(JobProgress { cursor: 0, total: 0 }.fraction(), 0.0);
        assert_eq!(JobProgress { cursor: 2, total: 8 }.fraction(), 0.25);
    }

    #[tokio::test]
    async fn test_start_requires_open_link() {
        let streamer = JobStreamer::new(Link::native(), StreamerOptions::default());
        let result = streamer.start("G1 X1").await;
        assert!(matches!(result, Err(JobError::Link(LinkError::NotConnected))));
        assert_eq!(streamer.state(), JobState::Idle);
    }

    #[tokio::test]
    async fn test_start_rejects_empty_program() {
        let streamer = JobStreamer::new(Link::native(), StreamerOptions::default());
        let result = streamer.start("; nothing\n\n(only comments)\n").await;
        assert!(matches!(result, Err(JobError::Empty)));
    }

    #[tokio::test]
    async fn test_controls_require_active_job() {
        let streamer = JobStreamer::new(Link::native(), StreamerOptions::default());
        assert!(matches!(streamer.pause().await, Err(JobError::NotRunning)));
        assert!(matches!(streamer.resume().await, Err(JobError::NotPaused)));
        assert!(matches!(streamer.stop().await, Err(JobError::NotRunning)));
    }
}
