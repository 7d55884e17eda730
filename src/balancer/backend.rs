use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use crate::metrics;

/// A single origin server with health and in-flight tracking.
///
/// Identity is the `Arc` allocation, not the URL string: two backends
/// constructed from the same URL are distinct records.
#[derive(Debug)]
pub struct Backend {
    /// URL of the origin (e.g., "http://app1.internal:8001")
    url: String,

    /// Configured static weight (≥ 1). Captured from configuration; no
    /// selector currently consumes it.
    weight: u32,

    /// Most recent probe or forwarding outcome. Backends start healthy.
    healthy: AtomicBool,

    /// Requests currently being proxied to this backend.
    in_flight: AtomicU32,
}

impl Backend {
    /// Create a new backend. New backends report healthy until a probe or a
    /// forwarding failure says otherwise.
    pub fn new(url: String, weight: u32) -> Arc<Self> {
        metrics::update_backend_health(&url, true);
        Arc::new(Self {
            url,
            weight,
            healthy: AtomicBool::new(true),
            in_flight: AtomicU32::new(0),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Update the health flag and the health gauge.
    pub fn set_health(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::Relaxed);
        metrics::update_backend_health(&self.url, healthy);
    }

    pub fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    /// Increment the in-flight counter.
    pub fn add_in_flight(&self) {
        let now = self.in_flight.fetch_add(1, Ordering::Relaxed) + 1;
        metrics::update_active_connections(&self.url, now);
    }

    /// Decrement the in-flight counter. A decrement from zero is a no-op.
    pub fn remove_in_flight(&self) {
        let updated = self
            .in_flight
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |n| n.checked_sub(1));
        if let Ok(prev) = updated {
            metrics::update_active_connections(&self.url, prev - 1);
        }
    }

    /// Current in-flight count. A hint only: concurrent handlers may have
    /// changed it by the time the caller acts on it.
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::Relaxed)
    }

    /// Reserve capacity on this backend. The returned guard decrements the
    /// in-flight count exactly once when dropped, on every exit path.
    pub fn acquire(self: &Arc<Self>) -> InFlightGuard {
        self.add_in_flight();
        InFlightGuard {
            backend: Arc::clone(self),
        }
    }
}

/// RAII handle pairing one in-flight increment with exactly one decrement.
#[derive(Debug)]
pub struct InFlightGuard {
    backend: Arc<Backend>,
}

impl InFlightGuard {
    pub fn backend(&self) -> &Arc<Backend> {
        &self.backend
    }
}

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.backend.remove_in_flight();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_backend_creation() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);
        assert_eq!(backend.url(), "http://app1:8001");
        assert_eq!(backend.weight(), 1);
        assert_eq!(backend.in_flight(), 0);
        assert!(backend.is_healthy());
    }

    #[test]
    fn test_health_toggle() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);

        backend.set_health(false);
        assert!(!backend.is_healthy());

        backend.set_health(true);
        assert!(backend.is_healthy());
    }

    #[test]
    fn test_in_flight_tracking() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);

        backend.add_in_flight();
        assert_eq!(backend.in_flight(), 1);

        backend.add_in_flight();
        assert_eq!(backend.in_flight(), 2);

        backend.remove_in_flight();
        assert_eq!(backend.in_flight(), 1);
    }

    #[test]
    fn test_remove_from_zero_is_noop() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);

        backend.remove_in_flight();
        assert_eq!(backend.in_flight(), 0);

        backend.add_in_flight();
        backend.remove_in_flight();
        backend.remove_in_flight();
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_guard_releases_once() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);

        {
            let _guard = backend.acquire();
            assert_eq!(backend.in_flight(), 1);
        }
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_guard_releases_on_panic() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);
        let cloned = Arc::clone(&backend);

        let result = thread::spawn(move || {
            let _guard = cloned.acquire();
            panic!("handler died");
        })
        .join();

        assert!(result.is_err());
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_concurrent_in_flight() {
        let backend = Backend::new("http://app1:8001".to_string(), 1);
        let cloned = Arc::clone(&backend);

        let handle = thread::spawn(move || {
            for _ in 0..1000 {
                let _guard = cloned.acquire();
            }
        });

        for _ in 0..1000 {
            let _guard = backend.acquire();
        }

        handle.join().unwrap();
        assert_eq!(backend.in_flight(), 0);
    }

    #[test]
    fn test_equal_urls_are_distinct_records() {
        let a = Backend::new("http://app1:8001".to_string(), 1);
        let b = Backend::new("http://app1:8001".to_string(), 1);

        a.set_health(false);
        assert!(!a.is_healthy());
        assert!(b.is_healthy());
        assert!(!Arc::ptr_eq(&a, &b));
    }
}
