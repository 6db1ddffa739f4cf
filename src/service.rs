use crate::cache::{CacheStats, SmartCache};
use crate::clock::SharedClock;
use crate::config::{AppConfig, PlanConfig, PlansConfig, RateLimitConfig};
use crate::error::{AppError, AppResult};
use crate::generator::{BrandKit, GenerateError, GenerateRequest, SharedGenerator};
use crate::queue::{GenerationJob, GenerationQueue, JobEvent, JobProcessor, NewJob, QueueStats, QueueStatus};
use crate::rate_limit::RateLimiter;
use crate::resilience::{BreakerSnapshot, RetryError, RetryHandler};
use crate::storage::KeyValueStore;
use crate::sweep::SweepHandle;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::{self, error::RecvError};

/// Subscription tier of the caller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Plan {
    #[default]
    Free,
    Pro,
    Premium,
}

impl FromStr for Plan {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "free" => Ok(Plan::Free),
            "pro" => Ok(Plan::Pro),
            "premium" => Ok(Plan::Premium),
            other => Err(AppError::Validation(format!("unknown plan: {other}"))),
        }
    }
}

impl PlansConfig {
    pub fn for_plan(&self, plan: Plan) -> &PlanConfig {
        match plan {
            Plan::Free => &self.free,
            Plan::Pro => &self.pro,
            Plan::Premium => &self.premium,
        }
    }
}

/// Where a submitted briefing's brand kit came from.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", content = "result", rename_all = "lowercase")]
pub enum Submission {
    Cached(BrandKit),
    Similar(BrandKit),
    Generated(BrandKit),
}

impl Submission {
    pub fn kit(&self) -> &BrandKit {
        match self {
            Submission::Cached(kit) | Submission::Similar(kit) | Submission::Generated(kit) => kit,
        }
    }
}

/// Queue processor that calls the remote generator under retry, timeout and
/// circuit breaking.
pub struct RemoteGeneration {
    generator: SharedGenerator,
    retry: Arc<RetryHandler>,
    timeout: Duration,
    operation_id: String,
}

impl JobProcessor for RemoteGeneration {
    type Output = BrandKit;
    type Error = RetryError<GenerateError>;

    fn process(&self, job: &GenerationJob) -> BoxFuture<'static, Result<BrandKit, Self::Error>> {
        let generator = Arc::clone(&self.generator);
        let retry = Arc::clone(&self.retry);
        let timeout = self.timeout;
        let operation_id = self.operation_id.clone();
        let request = GenerateRequest {
            briefing: job.briefing.clone(),
            variations_count: job.variations_count,
        };

        Box::pin(async move {
            retry
                .execute_with_timeout(|| generator.generate(request.clone()), timeout, &operation_id)
                .await
        })
    }

    /// An open breaker rejects every attempt until its reset timeout passes,
    /// so re-enqueueing only delays the 503.
    fn is_retryable(&self, error: &Self::Error) -> bool {
        !matches!(error, RetryError::CircuitOpen { .. })
    }
}

/// Queue snapshot served by the status endpoint.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueOverview {
    #[serde(flatten)]
    pub stats: QueueStats,
    pub status: QueueStatus,
}

/// Rate limit, cache, queue and retry handling composed around the remote
/// generator.
pub struct BrandService {
    limiter: Arc<RateLimiter>,
    cache: Arc<SmartCache>,
    retry: Arc<RetryHandler>,
    queue: GenerationQueue<RemoteGeneration>,
    rate_limit: RateLimitConfig,
    similarity_threshold: f64,
    cache_sweep_interval: Duration,
    plans: PlansConfig,
}

impl BrandService {
    pub fn new(
        config: &AppConfig,
        store: Arc<dyn KeyValueStore>,
        generator: SharedGenerator,
        clock: SharedClock,
    ) -> Self {
        let retry = Arc::new(RetryHandler::new(
            Arc::clone(&clock),
            config.retry.clone(),
            config.breaker.clone(),
        ));
        let processor = RemoteGeneration {
            generator,
            retry: Arc::clone(&retry),
            timeout: Duration::from_secs(config.generator.timeout_secs),
            operation_id: config.generator.operation_id.clone(),
        };

        Self {
            limiter: Arc::new(RateLimiter::new(Arc::clone(&clock))),
            cache: Arc::new(SmartCache::new(store, Arc::clone(&clock), &config.cache)),
            retry,
            queue: GenerationQueue::new(processor, clock, config.queue.clone()),
            rate_limit: config.rate_limit.clone(),
            similarity_threshold: config.cache.similarity_threshold,
            cache_sweep_interval: Duration::from_secs(config.cache.sweep_interval_secs),
            plans: config.plans.clone(),
        }
    }

    /// Start the rate limiter and durable cache sweeps. Dropping the handles
    /// stops them.
    pub fn start_sweepers(&self) -> Vec<SweepHandle> {
        vec![
            self.limiter
                .spawn_sweeper(Duration::from_secs(self.rate_limit.sweep_interval_secs)),
            self.cache.spawn_sweeper(self.cache_sweep_interval),
        ]
    }

    /// Produce a brand kit for `briefing`, from cache when possible, otherwise
    /// through the generation queue.
    pub async fn submit(&self, identity: &str, plan: Plan, briefing: &str) -> AppResult<Submission> {
        if identity.trim().is_empty() {
            return Err(AppError::Validation("user id is required".to_string()));
        }
        if briefing.trim().is_empty() {
            return Err(AppError::Validation("briefing must not be empty".to_string()));
        }

        let decision = self.limiter.check(
            identity,
            self.rate_limit.max_requests,
            Duration::from_secs(self.rate_limit.window_secs),
        );
        if !decision.allowed {
            let retry_after_secs = decision.retry_after_secs.unwrap_or(0);
            tracing::info!(identity, retry_after_secs, "generation rate limited");
            return Err(AppError::RateLimited { retry_after_secs });
        }

        if let Some(kit) = self
            .cache
            .get(briefing, identity)
            .await
            .and_then(|hit| decode_kit(hit.data))
        {
            tracing::debug!(identity, "serving cached brand kit");
            return Ok(Submission::Cached(kit));
        }

        if let Some(kit) = self
            .cache
            .find_similar(briefing, identity, self.similarity_threshold)
            .into_iter()
            .find_map(|hit| decode_kit(hit.data))
        {
            tracing::debug!(identity, "serving similar cached brand kit");
            return Ok(Submission::Similar(kit));
        }

        let kit = self.generate(identity, plan, briefing).await?;
        let data = serde_json::to_value(&kit).map_err(|e| AppError::Internal(e.to_string()))?;
        self.cache.set(briefing, identity, data).await;
        Ok(Submission::Generated(kit))
    }

    async fn generate(&self, identity: &str, plan: Plan, briefing: &str) -> AppResult<BrandKit> {
        let tier = self.plans.for_plan(plan);
        let mut events = self.queue.subscribe();
        let job_id = self.queue.enqueue(NewJob {
            user_id: identity.to_string(),
            briefing: briefing.to_string(),
            priority: tier.priority,
            variations_count: Some(tier.variations),
        });

        let kit = wait_for_job(&mut events, &job_id).await?;
        tracing::info!(identity, job_id = %job_id, "brand kit generated");
        Ok(kit)
    }

    pub fn queue_overview(&self) -> QueueOverview {
        QueueOverview {
            stats: self.queue.stats(),
            status: self.queue.status(),
        }
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    pub async fn clear_cache(&self, identity: &str) {
        self.cache.clear_identity(identity).await;
    }

    pub fn breaker_stats(&self) -> HashMap<String, BreakerSnapshot> {
        self.retry.breaker_stats()
    }

    pub fn reset_breaker(&self, operation_id: &str) -> bool {
        self.retry.reset_breaker(operation_id)
    }

    pub fn cache(&self) -> &Arc<SmartCache> {
        &self.cache
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }
}

type GenerationEvent = JobEvent<BrandKit, RetryError<GenerateError>>;

/// Wait for the terminal event of `job_id`. A lagged receiver may have
/// dropped that event, so lag is reported as an error instead of waiting on.
async fn wait_for_job(
    events: &mut broadcast::Receiver<GenerationEvent>,
    job_id: &str,
) -> AppResult<BrandKit> {
    loop {
        match events.recv().await {
            Ok(event) if event.job_id() != job_id => continue,
            Ok(JobEvent::Completed { output, wait_ms, .. }) => {
                tracing::debug!(job_id, wait_ms, "job completed");
                return Ok(output);
            }
            Ok(JobEvent::Failed {
                attempts, error, ..
            }) => {
                return Err(AppError::JobFailed {
                    job_id: job_id.to_string(),
                    attempts,
                    cause: error,
                });
            }
            Err(RecvError::Lagged(skipped)) => {
                tracing::error!(job_id, skipped, "job event receiver lagged");
                return Err(AppError::Internal(format!(
                    "lost track of job {job_id} after skipping {skipped} events"
                )));
            }
            Err(RecvError::Closed) => {
                return Err(AppError::Internal("job event channel closed".to_string()));
            }
        }
    }
}

fn decode_kit(data: serde_json::Value) -> Option<BrandKit> {
    match serde_json::from_value(data) {
        Ok(kit) => Some(kit),
        Err(e) => {
            tracing::warn!(error = %e, "ignoring undecodable cache entry");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::briefing_hash;
    use crate::clock::{Clock, ManualClock};
    use crate::generator::{BrandGenerator, Typography};
    use crate::queue::Priority;
    use crate::storage::MemoryStore;
    use std::sync::Mutex;

    fn kit(tag: &str) -> BrandKit {
        BrandKit {
            logos: vec![format!("https://cdn/{tag}.png")],
            colors: vec!["#101010".to_string()],
            typography: Typography {
                primary: "Inter".to_string(),
                secondary: "Lora".to_string(),
            },
            mockups: vec![],
        }
    }

    /// Returns a kit tagged with the briefing, or fails every call when `fail` is set.
    #[derive(Default)]
    struct FakeGenerator {
        fail: bool,
        requests: Mutex<Vec<GenerateRequest>>,
    }

    impl BrandGenerator for FakeGenerator {
        fn generate(&self, request: GenerateRequest) -> BoxFuture<'static, Result<BrandKit, GenerateError>> {
            self.requests.lock().unwrap().push(request.clone());
            let fail = self.fail;
            Box::pin(async move {
                if fail {
                    Err(GenerateError::Upstream {
                        status: 500,
                        message: "model overloaded".to_string(),
                    })
                } else {
                    Ok(kit(&request.briefing))
                }
            })
        }
    }

    fn test_config() -> AppConfig {
        let mut config = AppConfig::default();
        config.retry.jitter = false;
        config.retry.max_retries = 1;
        config.queue.max_retries = 0;
        config
    }

    fn service(generator: Arc<FakeGenerator>) -> (BrandService, ManualClock) {
        let clock = ManualClock::new(1_700_000_000_000);
        let service = BrandService::new(
            &test_config(),
            Arc::new(MemoryStore::new()),
            generator,
            Arc::new(clock.clone()),
        );
        (service, clock)
    }

    #[tokio::test]
    async fn test_generates_then_serves_from_cache() {
        let generator = Arc::new(FakeGenerator::default());
        let (service, clock) = service(generator.clone());

        let first = service.submit("u1", Plan::Free, "Organic bakery").await.unwrap();
        assert_eq!(first, Submission::Generated(kit("Organic bakery")));

        clock.advance(Duration::from_secs(61));
        let second = service.submit("u1", Plan::Free, "organic  BAKERY!").await.unwrap();
        assert_eq!(second, Submission::Cached(kit("Organic bakery")));
        assert_eq!(generator.requests.lock().unwrap().len(), 1);
        assert_eq!(service.cache_stats().hits, 1);
    }

    #[tokio::test]
    async fn test_second_request_in_window_is_rate_limited() {
        let (service, _clock) = service(Arc::new(FakeGenerator::default()));

        service.submit("u1", Plan::Free, "bakery").await.unwrap();
        match service.submit("u1", Plan::Free, "florist").await {
            Err(AppError::RateLimited { retry_after_secs }) => assert!(retry_after_secs > 0),
            other => panic!("expected rate limit, got {other:?}"),
        }

        // Other identities have their own window
        assert!(service.submit("u2", Plan::Free, "florist").await.is_ok());
    }

    #[tokio::test]
    async fn test_empty_briefing_is_rejected_without_consuming_quota() {
        let (service, _clock) = service(Arc::new(FakeGenerator::default()));

        assert!(matches!(
            service.submit("u1", Plan::Free, "   ").await,
            Err(AppError::Validation(_))
        ));
        assert!(service.submit("u1", Plan::Free, "bakery").await.is_ok());
    }

    #[tokio::test]
    async fn test_plan_sets_variations() {
        let generator = Arc::new(FakeGenerator::default());
        let (service, _clock) = service(generator.clone());

        service.submit("u1", Plan::Premium, "bakery").await.unwrap();
        let requests = generator.requests.lock().unwrap();
        assert_eq!(requests[0].variations_count, Some(12));
    }

    #[tokio::test]
    async fn test_similar_entry_is_served() {
        let generator = Arc::new(FakeGenerator::default());
        let (service, _clock) = service(generator.clone());
        let stored = serde_json::to_value(kit("stored")).unwrap();
        service.cache().set("coffee shop", "u1", stored).await;

        // Stored entries only keep their hash, so only the hash text is similar
        let hash = briefing_hash("coffee shop");
        let result = service.submit("u1", Plan::Free, &hash).await.unwrap();
        assert_eq!(result, Submission::Similar(kit("stored")));
        assert!(generator.requests.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_failing_generator_surfaces_job_failure() {
        let generator = Arc::new(FakeGenerator {
            fail: true,
            ..FakeGenerator::default()
        });
        let (service, _clock) = service(generator.clone());

        let err = service.submit("u1", Plan::Pro, "bakery").await.unwrap_err();
        match &err {
            AppError::JobFailed {
                attempts,
                cause: RetryError::Exhausted { last_error, .. },
                ..
            } => {
                assert_eq!(*attempts, 1);
                assert_eq!(
                    *last_error,
                    GenerateError::Upstream {
                        status: 500,
                        message: "model overloaded".to_string()
                    }
                );
            }
            other => panic!("expected job failure, got {other:?}"),
        }
        // One queue attempt, retried once inside the handler
        assert_eq!(generator.requests.lock().unwrap().len(), 2);
        assert_eq!(service.queue_overview().stats.failed, 1);
        assert!(service.cache_stats().size == 0);
    }

    #[tokio::test]
    async fn test_open_breaker_fails_job_without_queue_backoff() {
        let generator = Arc::new(FakeGenerator {
            fail: true,
            ..FakeGenerator::default()
        });
        let mut config = test_config();
        config.retry.max_retries = 0;
        config.breaker.failure_threshold = 1;
        config.queue.max_retries = 3;
        config.queue.inter_job_delay_ms = 0;
        let clock = ManualClock::new(1_700_000_000_000);
        let service = BrandService::new(
            &config,
            Arc::new(MemoryStore::new()),
            generator.clone(),
            Arc::new(clock.clone()),
        );

        // The first failure opens the breaker; the single queue retry then
        // hits it and stops there
        match service.submit("u1", Plan::Free, "bakery").await.unwrap_err() {
            AppError::JobFailed {
                attempts,
                cause: RetryError::CircuitOpen { .. },
                ..
            } => assert_eq!(attempts, 2),
            other => panic!("expected open circuit, got {other:?}"),
        }

        let before = clock.now_ms();
        let err = service.submit("u2", Plan::Free, "florist").await.unwrap_err();
        match &err {
            AppError::JobFailed {
                attempts,
                cause: RetryError::CircuitOpen { operation_id },
                ..
            } => {
                assert_eq!(*attempts, 1);
                assert_eq!(operation_id, "generate-brand");
            }
            other => panic!("expected open circuit, got {other:?}"),
        }
        assert_eq!(err.status(), axum::http::StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(err.kind(), "circuit_open");
        assert_eq!(clock.now_ms(), before);
        assert_eq!(generator.requests.lock().unwrap().len(), 1);
        assert_eq!(service.queue_overview().stats.failed, 2);
    }

    #[tokio::test]
    async fn test_lagged_event_receiver_reports_error() {
        let (tx, mut rx) = broadcast::channel::<GenerationEvent>(1);
        for other in ["job_a", "job_b"] {
            tx.send(JobEvent::Completed {
                job_id: other.to_string(),
                output: kit(other),
                wait_ms: 0,
            })
            .unwrap();
        }

        match wait_for_job(&mut rx, "job_c").await {
            Err(AppError::Internal(msg)) => assert!(msg.contains("job_c")),
            other => panic!("expected lag error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_wait_for_job_skips_other_jobs() {
        let (tx, mut rx) = broadcast::channel::<GenerationEvent>(8);
        tx.send(JobEvent::Completed {
            job_id: "job_a".to_string(),
            output: kit("a"),
            wait_ms: 0,
        })
        .unwrap();
        tx.send(JobEvent::Completed {
            job_id: "job_b".to_string(),
            output: kit("b"),
            wait_ms: 5,
        })
        .unwrap();

        assert_eq!(wait_for_job(&mut rx, "job_b").await.unwrap(), kit("b"));
    }

    #[test]
    fn test_plan_parsing_and_tiers() {
        assert_eq!("Premium".parse::<Plan>().unwrap(), Plan::Premium);
        assert!("gold".parse::<Plan>().is_err());

        let plans = PlansConfig::default();
        assert_eq!(plans.for_plan(Plan::Premium).priority, Priority::High);
        assert_eq!(plans.for_plan(Plan::Pro).priority, Priority::Normal);
        assert_eq!(plans.for_plan(Plan::Free).priority, Priority::Low);
    }

    #[test]
    fn test_submission_serializes_source_and_result() {
        let value = serde_json::to_value(Submission::Cached(kit("x"))).unwrap();
        assert_eq!(value["source"], "cached");
        assert_eq!(value["result"]["logos"][0], "https://cdn/x.png");
    }
}
