use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use super::{Backend, Balancer, BalancerError};

/// Round-robin policy: forward requests cyclically, skipping unhealthy
/// backends. Skipped entries do not reserve their slot; the next healthy
/// entry is returned immediately.
pub struct RoundRobinBalancer {
    backends: Vec<Arc<Backend>>,
    counter: AtomicU64,
}

impl RoundRobinBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self {
            backends,
            counter: AtomicU64::new(0),
        }
    }
}

impl Balancer for RoundRobinBalancer {
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        let n = self.backends.len();
        if n == 0 {
            return Err(BalancerError::NoBackends);
        }

        // Advance-then-mod: the counter is bumped before the index is taken,
        // so a fresh selector starts at backends[1 % n].
        for _ in 0..n {
            let turn = self.counter.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
            let next = &self.backends[(turn % n as u64) as usize];
            if next.is_healthy() {
                return Ok(Arc::clone(next));
            }
        }

        Err(BalancerError::NoneHealthy)
    }
}
