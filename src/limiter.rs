//! Adaptive rate limiter and batch sizing
//!
//! The upstream LLM endpoint's capacity is not known ahead of time and
//! can change mid-run, so both the inter-call delay and the batch size
//! follow a feedback loop over observed latency and success rate.

use std::sync::Mutex;
use std::time::Duration;
use tracing::debug;

const LATENCY_WINDOW: usize = 10;
const SLOWDOWN_FACTOR: f64 = 1.2;
const SPEEDUP_FACTOR: f64 = 0.8;
const FAILURE_FACTOR: f64 = 1.5;
const FAST_LATENCY_RATIO: f64 = 0.7;

const MAX_BATCH_SIZE: usize = 20;
const HIGH_SUCCESS_RATE: f64 = 0.9;
const MODERATE_SUCCESS_RATE: f64 = 0.7;
const FAST_DELAY_SECS: f64 = 1.5;
const MODERATE_DELAY_SECS: f64 = 3.0;

#[derive(Debug, Clone, Copy)]
pub struct LimiterConfig {
    pub min_delay: Duration,
    pub max_delay: Duration,
    pub initial_delay: Duration,
    /// Target upper bound for average call latency.
    pub target_latency: Duration,
}

impl Default for LimiterConfig {
    fn default() -> Self {
        Self {
            min_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(10),
            initial_delay: Duration::from_secs(1),
            target_latency: Duration::from_secs(5),
        }
    }
}

#[derive(Debug)]
struct LimiterState {
    current_delay: f64,
    latencies: Vec<f64>,
    success_count: u64,
    error_count: u64,
}

#[derive(Debug, Clone, Copy)]
pub struct LimiterStats {
    pub current_delay: Duration,
    pub avg_latency: Duration,
    pub success_rate: f64,
    pub error_count: u64,
}

/// Process-wide stateful service; constructed once per run and handed
/// to the pipeline and LLM client by handle.
pub struct AdaptiveRateLimiter {
    config: LimiterConfig,
    state: Mutex<LimiterState>,
}

impl AdaptiveRateLimiter {
    pub fn new(config: LimiterConfig) -> Self {
        let state = LimiterState {
            current_delay: config.initial_delay.as_secs_f64(),
            latencies: Vec::with_capacity(LATENCY_WINDOW),
            success_count: 0,
            error_count: 0,
        };
        Self {
            config,
            state: Mutex::new(state),
        }
    }

    /// Feed an observed call outcome back into the delay.
    pub fn record(&self, latency: Duration, success: bool) {
        let mut state = self.state.lock().expect("limiter lock poisoned");
        let min = self.config.min_delay.as_secs_f64();
        let max = self.config.max_delay.as_secs_f64();
        let target = self.config.target_latency.as_secs_f64();

        if success {
            state.success_count += 1;
            state.error_count = state.error_count.saturating_sub(1);

            state.latencies.push(latency.as_secs_f64());
            if state.latencies.len() > LATENCY_WINDOW {
                state.latencies.remove(0);
            }

            let avg = state.latencies.iter().sum::<f64>() / state.latencies.len() as f64;
            if avg > target {
                state.current_delay = (state.current_delay * SLOWDOWN_FACTOR).min(max);
            } else if avg <= target * FAST_LATENCY_RATIO {
                state.current_delay = (state.current_delay * SPEEDUP_FACTOR).max(min);
            }
        } else {
            state.error_count += 1;
            state.current_delay = (state.current_delay * FAILURE_FACTOR).min(max);
        }

        debug!(
            delay_secs = state.current_delay,
            success, "rate limiter updated"
        );
    }

    pub fn current_delay(&self) -> Duration {
        let state = self.state.lock().expect("limiter lock poisoned");
        Duration::from_secs_f64(state.current_delay)
    }

    /// Sleep for the current adaptive delay.
    pub async fn wait(&self) {
        let delay = self.current_delay();
        tokio::time::sleep(delay).await;
    }

    pub fn stats(&self) -> LimiterStats {
        let state = self.state.lock().expect("limiter lock poisoned");
        let total = state.success_count + state.error_count;
        let avg = if state.latencies.is_empty() {
            0.0
        } else {
            state.latencies.iter().sum::<f64>() / state.latencies.len() as f64
        };
        LimiterStats {
            current_delay: Duration::from_secs_f64(state.current_delay),
            avg_latency: Duration::from_secs_f64(avg),
            success_rate: if total == 0 {
                0.0
            } else {
                state.success_count as f64 / total as f64
            },
            error_count: state.error_count,
        }
    }

    /// Pick a batch size from the configured base and the observed
    /// success/latency feedback. Before any call has been recorded the
    /// requested size is used unchanged.
    pub fn batch_size(&self, base: usize) -> usize {
        let stats = self.stats();
        let delay = stats.current_delay.as_secs_f64();
        let no_data = stats.success_rate == 0.0 && stats.error_count == 0;

        if no_data && delay <= self.config.initial_delay.as_secs_f64() {
            return base.max(1);
        }

        if stats.success_rate > HIGH_SUCCESS_RATE && delay < FAST_DELAY_SECS {
            (base * 2).min(MAX_BATCH_SIZE)
        } else if stats.success_rate > MODERATE_SUCCESS_RATE && delay < MODERATE_DELAY_SECS {
            base.max(1)
        } else {
            (base / 2).max(1)
        }
    }
}

impl Default for AdaptiveRateLimiter {
    fn default() -> Self {
        Self::new(LimiterConfig::default())
    }
}
