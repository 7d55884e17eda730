//! Load balancing for the proxy.
//!
//! # Components
//!
//! - [`Backend`]: a single origin with health and in-flight tracking
//! - [`Balancer`]: the selector contract every policy implements
//! - [`HealthChecker`]: periodic background probes of `GET /health`
//!
//! # Policies
//!
//! - **roundrobin**: cycle through healthy backends in order
//! - **leastconn**: pick the healthy backend with the fewest in-flight
//!   requests
//! - **weighted**: weighted random selection favoring backends with lower
//!   average response times
//!
//! A selector never returns an unhealthy backend; with an empty set it
//! reports [`BalancerError::NoBackends`], and with no healthy member
//! [`BalancerError::NoneHealthy`].

pub mod backend;
pub mod health;
pub mod least_conn;
pub mod round_robin;
pub mod weighted;

pub use backend::{Backend, InFlightGuard};
pub use health::HealthChecker;
pub use least_conn::LeastConnBalancer;
pub use round_robin::RoundRobinBalancer;
pub use weighted::WeightedResponseTimeBalancer;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Selector outcomes that are not a backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BalancerError {
    #[error("no backends provided")]
    NoBackends,

    #[error("no healthy backend available")]
    NoneHealthy,

    #[error("invalid balancer method: {0}")]
    UnknownMethod(String),
}

/// Contract shared by all load balancing policies.
pub trait Balancer: Send + Sync {
    /// Pick the backend for the next request. The returned backend was
    /// healthy at some instant during the call.
    fn next_backend(&self) -> Result<Arc<Backend>, BalancerError>;

    /// Feed the elapsed wall time of a finished exchange back into the
    /// policy. Only the weighted policy consumes the samples.
    fn record_response_time(&self, _backend: &Arc<Backend>, _elapsed: Duration) {}
}

/// Construct the selector for a configured method name. The match is
/// case-sensitive.
pub fn build(
    method: &str,
    backends: Vec<Arc<Backend>>,
) -> Result<Arc<dyn Balancer>, BalancerError> {
    match method {
        "roundrobin" => Ok(Arc::new(RoundRobinBalancer::new(backends))),
        "leastconn" => Ok(Arc::new(LeastConnBalancer::new(backends))),
        "weighted" => Ok(Arc::new(WeightedResponseTimeBalancer::new(backends))),
        other => Err(BalancerError::UnknownMethod(other.to_string())),
    }
}
