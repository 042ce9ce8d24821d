//! Throttling wrapper for the LLM client.
//!
//! Adds bounded concurrency, a sliding-window rate limit, a base plus
//! adaptive inter-request delay, a three-state circuit breaker, and
//! continuously updated statistics on top of any [`ChatClient`]. This is
//! the only client the orchestrator sees; every public operation is safe
//! to call concurrently.

use crate::llm::{ChatClient, ChatRequest, ChatResponse, LlmError};
use async_trait::async_trait;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Exponential smoothing factor for the average response time.
const RESPONSE_TIME_ALPHA: f64 = 0.1;

/// Sliding rate-limit window.
const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Throttling configuration.
#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_concurrent: usize,
    pub requests_per_minute: usize,
    pub request_delay_ms: u64,
    pub target_response_time_ms: f64,
    pub adaptation_rate: f64,
    pub enable_circuit_breaker: bool,
    pub failure_threshold: u32,
    pub recovery_timeout: Duration,
    pub half_open_requests: u32,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_concurrent: 4,
            requests_per_minute: 60,
            request_delay_ms: 100,
            target_response_time_ms: 1000.0,
            adaptation_rate: 0.1,
            enable_circuit_breaker: true,
            failure_threshold: 3,
            recovery_timeout: Duration::from_secs(60),
            half_open_requests: 1,
        }
    }
}

/// Circuit breaker states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        }
    }
}

/// Bounded-failure-window state machine. Owned by the throttled client and
/// mutated only under its lock.
#[derive(Debug)]
pub struct CircuitBreaker {
    failure_threshold: u32,
    recovery_timeout: Duration,
    half_open_requests: u32,

    state: CircuitState,
    failure_count: u32,
    last_failure: Option<Instant>,
    half_open_successes: u32,
    opens: u64,
    last_open: Option<String>,
    last_close: Option<String>,
}

impl CircuitBreaker {
    pub fn new(failure_threshold: u32, recovery_timeout: Duration, half_open_requests: u32) -> Self {
        Self {
            failure_threshold,
            recovery_timeout,
            half_open_requests,
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure: None,
            half_open_successes: 0,
            opens: 0,
            last_open: None,
            last_close: None,
        }
    }

    /// Whether a new request may proceed. Handles the OPEN to HALF_OPEN
    /// transition when the recovery timeout has elapsed.
    pub fn can_execute(&mut self) -> bool {
        match self.state {
            CircuitState::Closed => true,
            CircuitState::Open => {
                let recovered = self
                    .last_failure
                    .map(|t| t.elapsed() >= self.recovery_timeout)
                    .unwrap_or(true);
                if recovered {
                    self.transition_half_open();
                    true
                } else {
                    false
                }
            }
            CircuitState::HalfOpen => self.half_open_successes < self.half_open_requests,
        }
    }

    pub fn record_success(&mut self) {
        match self.state {
            CircuitState::HalfOpen => {
                self.half_open_successes += 1;
                if self.half_open_successes >= self.half_open_requests {
                    self.transition_closed();
                }
            }
            CircuitState::Closed => self.failure_count = 0,
            CircuitState::Open => {}
        }
    }

    pub fn record_failure(&mut self) {
        self.failure_count += 1;
        self.last_failure = Some(Instant::now());

        match self.state {
            CircuitState::Closed => {
                if self.failure_count >= self.failure_threshold {
                    self.transition_open();
                }
            }
            CircuitState::HalfOpen => self.transition_open(),
            CircuitState::Open => {}
        }
    }

    pub fn state(&self) -> CircuitState {
        self.state
    }

    pub fn reset(&mut self) {
        self.failure_count = 0;
        self.half_open_successes = 0;
        if self.state != CircuitState::Closed {
            self.transition_closed();
        }
    }

    fn transition_open(&mut self) {
        self.state = CircuitState::Open;
        self.half_open_successes = 0;
        self.opens += 1;
        self.last_open = Some(chrono::Utc::now().to_rfc3339());
        warn!("Circuit breaker OPEN after {} failures", self.failure_count);
    }

    fn transition_half_open(&mut self) {
        self.state = CircuitState::HalfOpen;
        self.half_open_successes = 0;
        info!("Circuit breaker HALF_OPEN, testing recovery");
    }

    fn transition_closed(&mut self) {
        self.state = CircuitState::Closed;
        self.failure_count = 0;
        self.half_open_successes = 0;
        self.last_close = Some(chrono::Utc::now().to_rfc3339());
        info!("Circuit breaker CLOSED, service recovered");
    }
}

/// Self-tuning inter-request delay tracking a target average response time.
#[derive(Debug)]
pub struct AdaptiveDelay {
    target_ms: f64,
    min_delay_ms: f64,
    max_delay_ms: f64,
    adaptation_rate: f64,
    current_delay_ms: f64,
    window: VecDeque<f64>,
}

impl AdaptiveDelay {
    pub fn new(target_ms: f64, min_delay_ms: f64, max_delay_ms: f64, adaptation_rate: f64) -> Self {
        Self {
            target_ms,
            min_delay_ms,
            max_delay_ms,
            adaptation_rate,
            current_delay_ms: min_delay_ms,
            window: VecDeque::with_capacity(10),
        }
    }

    pub fn record(&mut self, response_time_ms: f64) {
        if self.window.len() == 10 {
            self.window.pop_front();
        }
        self.window.push_back(response_time_ms);

        if self.window.len() < 3 {
            return;
        }

        let avg = self.window.iter().sum::<f64>() / self.window.len() as f64;
        if avg > self.target_ms {
            let increase = (avg - self.target_ms) * self.adaptation_rate;
            self.current_delay_ms = (self.current_delay_ms + increase).min(self.max_delay_ms);
        } else {
            let decrease = (self.target_ms - avg) * self.adaptation_rate * 0.5;
            self.current_delay_ms = (self.current_delay_ms - decrease).max(self.min_delay_ms);
        }
        debug!(
            "Adaptive delay adjusted to {:.1}ms (avg response {:.1}ms)",
            self.current_delay_ms, avg
        );
    }

    pub fn current_delay_ms(&self) -> f64 {
        self.current_delay_ms
    }

    pub fn set_min_delay_ms(&mut self, min_delay_ms: f64) {
        self.min_delay_ms = min_delay_ms;
        self.current_delay_ms = self.current_delay_ms.max(min_delay_ms);
    }

    pub fn reset(&mut self) {
        self.window.clear();
        self.current_delay_ms = self.min_delay_ms;
    }
}

#[derive(Debug, Default)]
struct StatsInner {
    total_requests: u64,
    throttled_requests: u64,
    rejected_requests: u64,
    successful_requests: u64,
    failed_requests: u64,
    cancelled_requests: u64,
    average_response_time_ms: f64,
    current_rate_per_sec: f64,
    adaptive_delay_ms: f64,
}

/// Snapshot of throttling statistics.
#[derive(Debug, Clone, Serialize)]
pub struct ThrottleStats {
    pub total_requests: u64,
    pub throttled_requests: u64,
    pub rejected_requests: u64,
    pub successful_requests: u64,
    pub failed_requests: u64,
    pub cancelled_requests: u64,
    pub average_response_time_ms: f64,
    pub current_rate_per_sec: f64,
    pub adaptive_delay_ms: f64,
    pub queue_size: usize,
    pub semaphore_available: usize,
    pub max_concurrent: usize,
    pub requests_per_minute: usize,
    pub request_delay_ms: u64,
    pub circuit_state: CircuitState,
    pub circuit_opens: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_circuit_open: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_circuit_close: Option<String>,
}

#[derive(Debug, Clone)]
struct DynamicLimits {
    max_concurrent: usize,
    requests_per_minute: usize,
    request_delay_ms: u64,
}

/// Throttled LLM client (C6).
pub struct ThrottledClient {
    inner: Arc<dyn ChatClient>,
    enable_circuit_breaker: bool,
    limits: Mutex<DynamicLimits>,
    semaphore: RwLock<Arc<Semaphore>>,
    history: tokio::sync::Mutex<VecDeque<Instant>>,
    adaptive: Mutex<AdaptiveDelay>,
    breaker: Mutex<CircuitBreaker>,
    stats: Mutex<StatsInner>,
    waiting: AtomicUsize,
}

impl ThrottledClient {
    pub fn new(inner: Arc<dyn ChatClient>, config: ThrottleConfig) -> Self {
        info!(
            "ThrottledClient initialized: concurrent_limit={}, rate_limit={} req/min, circuit_breaker={}",
            config.max_concurrent,
            config.requests_per_minute,
            if config.enable_circuit_breaker { "enabled" } else { "disabled" },
        );

        let base_delay = config.request_delay_ms as f64;
        Self {
            inner,
            enable_circuit_breaker: config.enable_circuit_breaker,
            limits: Mutex::new(DynamicLimits {
                max_concurrent: config.max_concurrent,
                requests_per_minute: config.requests_per_minute,
                request_delay_ms: config.request_delay_ms,
            }),
            semaphore: RwLock::new(Arc::new(Semaphore::new(config.max_concurrent))),
            history: tokio::sync::Mutex::new(VecDeque::new()),
            adaptive: Mutex::new(AdaptiveDelay::new(
                config.target_response_time_ms,
                base_delay,
                base_delay.max(1.0) * 10.0,
                config.adaptation_rate,
            )),
            breaker: Mutex::new(CircuitBreaker::new(
                config.failure_threshold,
                config.recovery_timeout,
                config.half_open_requests,
            )),
            stats: Mutex::new(StatsInner::default()),
            waiting: AtomicUsize::new(0),
        }
    }

    /// Dynamically update throttling limits. A changed concurrency bound
    /// swaps in a fresh semaphore; in-flight permits on the old one stay
    /// valid until released.
    pub fn update_limits(
        &self,
        max_concurrent: Option<usize>,
        requests_per_minute: Option<usize>,
        request_delay_ms: Option<u64>,
    ) {
        let mut limits = self.limits.lock().unwrap();

        if let Some(n) = max_concurrent {
            if n != limits.max_concurrent && n > 0 {
                limits.max_concurrent = n;
                *self.semaphore.write().unwrap() = Arc::new(Semaphore::new(n));
                info!("Updated max_concurrent to {}", n);
            }
        }
        if let Some(rpm) = requests_per_minute {
            limits.requests_per_minute = rpm;
            info!("Updated requests_per_minute to {}", rpm);
        }
        if let Some(delay) = request_delay_ms {
            limits.request_delay_ms = delay;
            self.adaptive.lock().unwrap().set_min_delay_ms(delay as f64);
            info!("Updated request_delay_ms to {}", delay);
        }
    }

    pub async fn reset_statistics(&self) {
        *self.stats.lock().unwrap() = StatsInner::default();
        self.history.lock().await.clear();
        self.adaptive.lock().unwrap().reset();
        self.breaker.lock().unwrap().reset();
        info!("Throttling statistics reset");
    }

    pub fn stats(&self) -> ThrottleStats {
        let stats = self.stats.lock().unwrap();
        let limits = self.limits.lock().unwrap();
        let breaker = self.breaker.lock().unwrap();
        let semaphore_available = self.semaphore.read().unwrap().available_permits();

        ThrottleStats {
            total_requests: stats.total_requests,
            throttled_requests: stats.throttled_requests,
            rejected_requests: stats.rejected_requests,
            successful_requests: stats.successful_requests,
            failed_requests: stats.failed_requests,
            cancelled_requests: stats.cancelled_requests,
            average_response_time_ms: stats.average_response_time_ms,
            current_rate_per_sec: stats.current_rate_per_sec,
            adaptive_delay_ms: stats.adaptive_delay_ms,
            queue_size: self.waiting.load(Ordering::Relaxed),
            semaphore_available,
            max_concurrent: limits.max_concurrent,
            requests_per_minute: limits.requests_per_minute,
            request_delay_ms: limits.request_delay_ms,
            circuit_state: breaker.state(),
            circuit_opens: breaker.opens,
            last_circuit_open: breaker.last_open.clone(),
            last_circuit_close: breaker.last_close.clone(),
        }
    }

    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.lock().unwrap().state()
    }

    /// Wait until the sliding window has room. The window lock is held
    /// across the sleep so concurrent callers queue up behind it.
    async fn wait_for_rate_limit(&self) {
        let rpm = self.limits.lock().unwrap().requests_per_minute;
        let mut history = self.history.lock().await;

        let now = Instant::now();
        while history
            .front()
            .map(|t| now.duration_since(*t) >= RATE_WINDOW)
            .unwrap_or(false)
        {
            history.pop_front();
        }

        if history.len() >= rpm {
            if let Some(oldest) = history.front().copied() {
                let elapsed = Instant::now().duration_since(oldest);
                if elapsed < RATE_WINDOW {
                    let wait = RATE_WINDOW - elapsed;
                    info!("Rate limit reached, waiting {:?}", wait);
                    self.stats.lock().unwrap().throttled_requests += 1;
                    tokio::time::sleep(wait).await;
                }
            }

            let now = Instant::now();
            while history
                .front()
                .map(|t| now.duration_since(*t) >= RATE_WINDOW)
                .unwrap_or(false)
            {
                history.pop_front();
            }
        }
    }

    async fn apply_request_delay(&self) {
        let base_ms = self.limits.lock().unwrap().request_delay_ms as f64;
        let adaptive_ms = self.adaptive.lock().unwrap().current_delay_ms();
        self.stats.lock().unwrap().adaptive_delay_ms = adaptive_ms;

        let total_ms = base_ms.max(adaptive_ms);
        if total_ms > 0.0 {
            tokio::time::sleep(Duration::from_micros((total_ms * 1000.0) as u64)).await;
        }
    }

    async fn record_completion(&self, response_time_ms: f64) {
        self.adaptive.lock().unwrap().record(response_time_ms);

        let mut history = self.history.lock().await;
        history.push_back(Instant::now());

        let rate = if history.len() > 1 {
            let span = history
                .back()
                .unwrap()
                .duration_since(*history.front().unwrap())
                .as_secs_f64();
            if span > 0.0 {
                history.len() as f64 / span
            } else {
                0.0
            }
        } else {
            0.0
        };
        drop(history);

        let mut stats = self.stats.lock().unwrap();
        stats.current_rate_per_sec = rate;
        if stats.average_response_time_ms == 0.0 {
            stats.average_response_time_ms = response_time_ms;
        } else {
            stats.average_response_time_ms = RESPONSE_TIME_ALPHA * response_time_ms
                + (1.0 - RESPONSE_TIME_ALPHA) * stats.average_response_time_ms;
        }
    }
}

#[async_trait]
impl ChatClient for ThrottledClient {
    async fn generate(&self, request: &ChatRequest) -> Result<ChatResponse, LlmError> {
        self.stats.lock().unwrap().total_requests += 1;

        if self.enable_circuit_breaker && !self.breaker.lock().unwrap().can_execute() {
            self.stats.lock().unwrap().rejected_requests += 1;
            return Err(LlmError::CircuitOpen);
        }

        self.wait_for_rate_limit().await;
        self.apply_request_delay().await;

        let semaphore = self.semaphore.read().unwrap().clone();
        self.waiting.fetch_add(1, Ordering::Relaxed);
        let permit = semaphore.acquire_owned().await;
        self.waiting.fetch_sub(1, Ordering::Relaxed);
        let _permit = match permit {
            Ok(permit) => permit,
            Err(_) => return Err(LlmError::Cancelled),
        };

        let start = Instant::now();
        let result = self.inner.generate(request).await;
        let response_time_ms = start.elapsed().as_secs_f64() * 1000.0;

        match &result {
            Ok(_) => {
                self.stats.lock().unwrap().successful_requests += 1;
                if self.enable_circuit_breaker {
                    self.breaker.lock().unwrap().record_success();
                }
            }
            Err(LlmError::Cancelled) => {
                // Neutral outcome: no circuit tick, no latency sample.
                self.stats.lock().unwrap().cancelled_requests += 1;
                return result;
            }
            Err(e) => {
                debug!("Throttled request failed: {}", e);
                self.stats.lock().unwrap().failed_requests += 1;
                if self.enable_circuit_breaker {
                    self.breaker.lock().unwrap().record_failure();
                }
            }
        }

        self.record_completion(response_time_ms).await;
        result
    }
}
