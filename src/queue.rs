use crate::clock::SharedClock;
use crate::config::QueueConfig;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Normal,
    Low,
}

impl Priority {
    /// Lower rank is served first.
    pub fn rank(self) -> u8 {
        match self {
            Priority::High => 0,
            Priority::Normal => 1,
            Priority::Low => 2,
        }
    }
}

/// One pending or in-flight generation request.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationJob {
    pub id: String,
    pub user_id: String,
    pub briefing: String,
    /// Creation time, unix millis. Unchanged across retries.
    pub created_at: i64,
    pub priority: Priority,
    pub retries: u32,
    pub max_retries: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub variations_count: Option<u32>,
}

/// Parameters for a job about to be enqueued.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub user_id: String,
    pub briefing: String,
    pub priority: Priority,
    pub variations_count: Option<u32>,
}

/// Executes a single job. Called by the queue worker, one job at a time.
pub trait JobProcessor: Send + Sync + 'static {
    type Output: Clone + Send + 'static;
    type Error: Clone + fmt::Display + Send + 'static;

    fn process(&self, job: &GenerationJob) -> BoxFuture<'static, Result<Self::Output, Self::Error>>;

    /// Whether a failed attempt may be re-enqueued. Errors that cannot heal
    /// within the backoff window fail the job at once.
    fn is_retryable(&self, _error: &Self::Error) -> bool {
        true
    }
}

/// Terminal outcome of a job, published to subscribers.
#[derive(Debug, Clone)]
pub enum JobEvent<O, E> {
    Completed {
        job_id: String,
        output: O,
        wait_ms: i64,
    },
    Failed {
        job_id: String,
        attempts: u32,
        error: E,
    },
}

impl<O, E> JobEvent<O, E> {
    pub fn job_id(&self) -> &str {
        match self {
            JobEvent::Completed { job_id, .. } | JobEvent::Failed { job_id, .. } => job_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct QueueStats {
    pub pending: u64,
    pub processing: u64,
    pub completed: u64,
    pub failed: u64,
    pub average_wait_ms: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueStatus {
    pub is_processing: bool,
    pub current_job: Option<GenerationJob>,
    pub queue_length: usize,
}

#[derive(Default)]
struct Counters {
    pending: u64,
    processing: u64,
    completed: u64,
    failed: u64,
    total_wait_ms: i64,
}

#[derive(Default)]
struct QueueState {
    jobs: VecDeque<GenerationJob>,
    running: bool,
    current: Option<GenerationJob>,
    counters: Counters,
}

impl QueueState {
    /// Insert ahead of the first job with a strictly lower priority.
    fn insert_by_priority(&mut self, job: GenerationJob) {
        let rank = job.priority.rank();
        let index = self
            .jobs
            .iter()
            .position(|queued| queued.priority.rank() > rank)
            .unwrap_or(self.jobs.len());
        self.jobs.insert(index, job);
        self.counters.pending += 1;
    }
}

struct QueueInner<P: JobProcessor> {
    state: Mutex<QueueState>,
    processor: P,
    clock: SharedClock,
    config: QueueConfig,
    events: broadcast::Sender<JobEvent<P::Output, P::Error>>,
}

/// Priority-aware sequential job queue. Clones share the same queue.
pub struct GenerationQueue<P: JobProcessor> {
    inner: Arc<QueueInner<P>>,
}

impl<P: JobProcessor> Clone for GenerationQueue<P> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<P: JobProcessor> GenerationQueue<P> {
    pub fn new(processor: P, clock: SharedClock, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(config.event_capacity.max(1));
        Self {
            inner: Arc::new(QueueInner {
                state: Mutex::new(QueueState::default()),
                processor,
                clock,
                config,
                events,
            }),
        }
    }

    /// Receive terminal job outcomes. Subscribe before enqueueing to avoid
    /// missing a fast job.
    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent<P::Output, P::Error>> {
        self.inner.events.subscribe()
    }

    /// Enqueue a job and return its id. Processing happens in the background.
    pub fn add_job(&self, user_id: &str, briefing: &str, priority: Priority) -> String {
        self.enqueue(NewJob {
            user_id: user_id.to_string(),
            briefing: briefing.to_string(),
            priority,
            variations_count: None,
        })
    }

    pub fn enqueue(&self, new_job: NewJob) -> String {
        let now = self.inner.clock.now_ms();
        let id = format!(
            "job_{now}_{}",
            &uuid::Uuid::new_v4().simple().to_string()[..9]
        );
        let job = GenerationJob {
            id: id.clone(),
            user_id: new_job.user_id,
            briefing: new_job.briefing,
            created_at: now,
            priority: new_job.priority,
            retries: 0,
            max_retries: self.inner.config.max_retries,
            variations_count: new_job.variations_count,
        };

        tracing::debug!(job_id = %id, priority = ?job.priority, "job enqueued");
        QueueInner::push(&self.inner, job);
        id
    }

    /// Remove a pending job. In-flight jobs cannot be cancelled.
    pub fn cancel_job(&self, job_id: &str) -> bool {
        let mut state = self.inner.lock();
        match state.jobs.iter().position(|job| job.id == job_id) {
            Some(index) => {
                state.jobs.remove(index);
                state.counters.pending = state.counters.pending.saturating_sub(1);
                true
            }
            None => false,
        }
    }

    pub fn clear_queue(&self) {
        let mut state = self.inner.lock();
        state.jobs.clear();
        state.counters.pending = 0;
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.inner.lock();
        let c = &state.counters;
        QueueStats {
            pending: c.pending,
            processing: c.processing,
            completed: c.completed,
            failed: c.failed,
            average_wait_ms: if c.completed > 0 {
                c.total_wait_ms as f64 / c.completed as f64
            } else {
                0.0
            },
        }
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.inner.lock();
        QueueStatus {
            is_processing: state.running,
            current_job: state.current.clone(),
            queue_length: state.jobs.len(),
        }
    }
}

impl<P: JobProcessor> QueueInner<P> {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        match self.state.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Insert a job and start the worker if it is idle.
    fn push(inner: &Arc<Self>, job: GenerationJob) {
        let start = {
            let mut state = inner.lock();
            state.insert_by_priority(job);
            !std::mem::replace(&mut state.running, true)
        };
        if start {
            tokio::spawn(Self::run_worker(Arc::clone(inner)));
        }
    }

    async fn run_worker(inner: Arc<Self>) {
        tracing::debug!("queue worker started");
        loop {
            let job = {
                let mut state = inner.lock();
                match state.jobs.pop_front() {
                    Some(job) => {
                        state.counters.pending = state.counters.pending.saturating_sub(1);
                        state.counters.processing += 1;
                        state.current = Some(job.clone());
                        job
                    }
                    None => {
                        state.running = false;
                        break;
                    }
                }
            };

            let result = inner.processor.process(&job).await;
            inner.finish(job, result);

            inner
                .clock
                .sleep(Duration::from_millis(inner.config.inter_job_delay_ms))
                .await;
        }
        tracing::debug!("queue worker idle");
    }

    fn finish(self: &Arc<Self>, mut job: GenerationJob, result: Result<P::Output, P::Error>) {
        let now = self.clock.now_ms();
        let event = {
            let mut state = self.lock();
            state.counters.processing = state.counters.processing.saturating_sub(1);
            state.current = None;

            match result {
                Ok(output) => {
                    let wait_ms = now - job.created_at;
                    state.counters.completed += 1;
                    state.counters.total_wait_ms += wait_ms;
                    tracing::info!(job_id = %job.id, wait_ms, "job completed");
                    Some(JobEvent::Completed {
                        job_id: job.id,
                        output,
                        wait_ms,
                    })
                }
                Err(error)
                    if job.retries < job.max_retries && self.processor.is_retryable(&error) =>
                {
                    job.retries += 1;
                    let delay = Duration::from_millis(
                        self.config.retry_backoff_ms.saturating_mul(1u64 << job.retries.min(32)),
                    );
                    tracing::warn!(
                        job_id = %job.id,
                        retries = job.retries,
                        delay_ms = delay.as_millis() as u64,
                        error = %error,
                        "job failed, scheduling retry"
                    );
                    self.schedule_retry(job, delay);
                    None
                }
                Err(error) => {
                    state.counters.failed += 1;
                    tracing::error!(
                        job_id = %job.id,
                        attempts = job.retries + 1,
                        error = %error,
                        "job failed permanently"
                    );
                    Some(JobEvent::Failed {
                        job_id: job.id,
                        attempts: job.retries + 1,
                        error,
                    })
                }
            }
        };

        if let Some(event) = event {
            // No subscribers is fine
            let _ = self.events.send(event);
        }
    }

    fn schedule_retry(self: &Arc<Self>, job: GenerationJob, delay: Duration) {
        let inner = Arc::clone(self);
        tokio::spawn(async move {
            inner.clock.sleep(delay).await;
            Self::push(&inner, job);
        });
    }
}
