use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Duration, Instant};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{Backend, Balancer, BalancerError};

/// Weight handed to a backend with no recorded samples, so cold backends
/// still get explored.
const DEFAULT_WEIGHT: f64 = 10.0;

/// Floor under every computed weight, so no live backend is fully starved.
const MIN_WEIGHT: f64 = 0.1;

/// Half-life of the exponential decay applied to stale averages.
const HALF_LIFE: Duration = Duration::from_secs(24 * 60 * 60);

/// Per-backend response time statistics.
#[derive(Debug)]
struct ResponseTimeTracker {
    total_time: Duration,
    request_count: u64,
    last_update: Instant,
}

impl ResponseTimeTracker {
    fn new() -> Self {
        Self {
            total_time: Duration::ZERO,
            request_count: 0,
            last_update: Instant::now(),
        }
    }
}

/// Weighted response-time policy: weighted random selection where the weight
/// of a backend is the inverse of its decayed average response time, so
/// faster backends draw proportionally more traffic.
pub struct WeightedResponseTimeBalancer {
    backends: Vec<Arc<Backend>>,
    trackers: RwLock<HashMap<usize, ResponseTimeTracker>>,
    rng: Mutex<StdRng>,
}

/// Trackers are keyed by record identity, not URL: two backends configured
/// with the same URL keep separate statistics.
fn key(backend: &Arc<Backend>) -> usize {
    Arc::as_ptr(backend) as usize
}

impl WeightedResponseTimeBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        let trackers = backends
            .iter()
            .map(|b| (key(b), ResponseTimeTracker::new()))
            .collect();

        Self {
            backends,
            trackers: RwLock::new(trackers),
            rng: Mutex::new(StdRng::from_entropy()),
        }
    }

    /// Replace the random source with a seeded one, for deterministic tests.
    pub fn set_seed(&self, seed: u64) {
        if let Ok(mut rng) = self.rng.lock() {
            *rng = StdRng::seed_from_u64(seed);
        }
    }

    /// Current weight of a backend under the policy.
    pub fn weight_of(&self, backend: &Arc<Backend>) -> f64 {
        match self.trackers.read() {
            Ok(trackers) => Self::calculate_weight(&trackers, backend),
            Err(_) => DEFAULT_WEIGHT,
        }
    }

    /// Average of the recorded samples, or zero when none exist.
    pub fn average_response_time(&self, backend: &Arc<Backend>) -> Duration {
        let trackers = match self.trackers.read() {
            Ok(trackers) => trackers,
            Err(_) => return Duration::ZERO,
        };
        match trackers.get(&key(backend)) {
            Some(t) if t.request_count > 0 => t.total_time / t.request_count as u32,
            _ => Duration::ZERO,
        }
    }

    /// Drop all recorded samples.
    pub fn reset_stats(&self) {
        if let Ok(mut trackers) = self.trackers.write() {
            for tracker in trackers.values_mut() {
                *tracker = ResponseTimeTracker::new();
            }
        }
    }

    fn calculate_weight(
        trackers: &HashMap<usize, ResponseTimeTracker>,
        backend: &Arc<Backend>,
    ) -> f64 {
        let tracker = match trackers.get(&key(backend)) {
            Some(t) if t.request_count > 0 => t,
            _ => return DEFAULT_WEIGHT,
        };

        let avg = tracker.total_time / tracker.request_count as u32;
        let avg_ms = avg.as_millis() as f64;

        let decay = decay_factor(tracker.last_update);
        let weight = decay * 1000.0 / (avg_ms + 1.0);

        weight.max(MIN_WEIGHT)
    }

    fn select_by_weight(
        &self,
        backends: &[&Arc<Backend>],
        weights: &[f64],
    ) -> Arc<Backend> {
        let total: f64 = weights.iter().sum();
        if total == 0.0 {
            return Arc::clone(backends[0]);
        }

        let draw = match self.rng.lock() {
            Ok(mut rng) => rng.gen::<f64>() * total,
            Err(_) => 0.0,
        };

        let mut cumulative = 0.0;
        for (backend, weight) in backends.iter().copied().zip(weights.iter().copied()) {
            cumulative += weight;
            if draw <= cumulative {
                return Arc::clone(backend);
            }
        }

        // Floating-point drift can leave the draw above the final cumulative
        // sum; the last entry absorbs it.
        Arc::clone(backends[backends.len() - 1])
    }
}

/// Exponential decay on the time since the last recorded sample.
fn decay_factor(last_update: Instant) -> f64 {
    let since_update = last_update.elapsed();
    (-(since_update.as_secs_f64() / HALF_LIFE.as_secs_f64()) * std::f64::consts::LN_2).exp()
}

impl Balancer for WeightedResponseTimeBalancer {
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackends);
        }

        let mut healthy = Vec::with_capacity(self.backends.len());
        let mut weights = Vec::with_capacity(self.backends.len());
        {
            let trackers = match self.trackers.read() {
                Ok(trackers) => trackers,
                Err(_) => return Err(BalancerError::NoneHealthy),
            };
            for backend in &self.backends {
                if backend.is_healthy() {
                    weights.push(Self::calculate_weight(&trackers, backend));
                    healthy.push(backend);
                }
            }
        }

        if healthy.is_empty() {
            return Err(BalancerError::NoneHealthy);
        }

        Ok(self.select_by_weight(&healthy, &weights))
    }

    fn record_response_time(&self, backend: &Arc<Backend>, elapsed: Duration) {
        if let Ok(mut trackers) = self.trackers.write() {
            let tracker = trackers
                .entry(key(backend))
                .or_insert_with(ResponseTimeTracker::new);
            tracker.total_time += elapsed;
            tracker.request_count += 1;
            tracker.last_update = Instant::now();
        }
    }
}
