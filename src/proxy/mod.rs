//! HTTP reverse proxy server.
//!
//! Accepts client connections, picks a backend through the configured
//! balancer, forwards the exchange and streams the response back. The
//! per-request accounting (in-flight counts, response-time samples, request
//! metrics) is released exactly once per request by [`stream::RequestRelease`].

mod server;
mod stream;

pub use server::ProxyServer;
