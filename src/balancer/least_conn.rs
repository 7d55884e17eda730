use std::sync::Arc;

use super::{Backend, Balancer, BalancerError};

/// Least-connections policy: a linear scan over healthy backends for the
/// smallest in-flight count, ties broken by list order.
///
/// The backend set is small (typically tens), so a scan on every call beats
/// maintaining a heap through external in-flight mutations.
pub struct LeastConnBalancer {
    backends: Vec<Arc<Backend>>,
}

impl LeastConnBalancer {
    pub fn new(backends: Vec<Arc<Backend>>) -> Self {
        Self { backends }
    }
}

impl Balancer for LeastConnBalancer {
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError> {
        if self.backends.is_empty() {
            return Err(BalancerError::NoBackends);
        }

        self.backends
            .iter()
            .filter(|b| b.is_healthy())
            .min_by_key(|b| b.in_flight())
            .map(Arc::clone)
            .ok_or(BalancerError::NoneHealthy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_backends(urls: &[&str]) -> Vec<Arc<Backend>> {
        urls.iter()
            .map(|url| Backend::new(url.to_string(), 1))
            .collect()
    }

    #[test]
    fn test_picks_least_loaded() {
        let backends = create_backends(&["http://a", "http://b"]);
        backends[0].add_in_flight();
        backends[0].add_in_flight();

        let lc = LeastConnBalancer::new(backends);
        assert_eq!(lc.next_backend().unwrap().url(), "http://b");
    }

    #[test]
    fn test_tie_breaks_by_list_order() {
        let backends = create_backends(&["http://a", "http://b", "http://c"]);
        let lc = LeastConnBalancer::new(backends);

        // All idle: the earliest entry wins.
        assert_eq!(lc.next_backend().unwrap().url(), "http://a");
    }

    #[test]
    fn test_skips_unhealthy_minimum() {
        let backends = create_backends(&["http://a", "http://b"]);
        backends[0].set_health(false);
        backends[1].add_in_flight();
        backends[1].add_in_flight();

        // a is idle but unhealthy; the loaded-but-healthy b is chosen.
        let lc = LeastConnBalancer::new(backends);
        assert_eq!(lc.next_backend().unwrap().url(), "http://b");
    }

    #[test]
    fn test_tracks_load_changes() {
        let backends = create_backends(&["http://a", "http://b"]);
        let lc = LeastConnBalancer::new(backends.clone());

        let first = lc.next_backend().unwrap();
        let _guard = first.acquire();

        let second = lc.next_backend().unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
    }

    #[test]
    fn test_empty_backends() {
        let lc = LeastConnBalancer::new(Vec::new());
        assert_eq!(lc.next_backend().err(), Some(BalancerError::NoBackends));
    }

    #[test]
    fn test_all_unhealthy() {
        let backends = create_backends(&["http://a", "http://b"]);
        backends[0].set_health(false);
        backends[1].set_health(false);

        let lc = LeastConnBalancer::new(backends);
        assert_eq!(lc.next_backend().err(), Some(BalancerError::NoneHealthy));
    }

    #[test]
    fn test_never_exceeds_minimum() {
        let backends = create_backends(&["http://a", "http://b", "http://c"]);
        backends[0].add_in_flight();
        backends[2].add_in_flight();
        backends[2].add_in_flight();

        let lc = LeastConnBalancer::new(backends.clone());
        let chosen = lc.next_backend().unwrap();

        let min = backends.iter().map(|b| b.in_flight()).min().unwrap();
        assert_eq!(chosen.in_flight(), min);
    }
}
