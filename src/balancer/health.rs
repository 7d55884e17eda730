use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::Empty;
use hyper::{Method, Request, StatusCode, Uri};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client as HyperClient;
use hyper_util::rt::TokioExecutor;
use native_tls::TlsConnector;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::Backend;

/// Default pause between probe rounds.
pub const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(5);

/// Per-probe deadline. A backend that cannot answer `/health` in this window
/// is treated as down.
const PROBE_TIMEOUT: Duration = Duration::from_secs(2);

type ProbeClient = HyperClient<HttpsConnector<HttpConnector>, Empty<Bytes>>;

/// Periodically probes every backend's `/health` endpoint and updates the
/// health flags the selectors read.
///
/// Each round fans out one sub-task per backend; probes do not wait on each
/// other, and a failed probe is retried only by the next round.
pub struct HealthChecker {
    backends: Vec<Arc<Backend>>,
    interval: Duration,
    client: ProbeClient,
    stop_tx: watch::Sender<bool>,
    stop_rx: watch::Receiver<bool>,
}

impl HealthChecker {
    pub fn new(backends: Vec<Arc<Backend>>, interval: Duration) -> Self {
        let mut http = HttpConnector::new();
        http.set_nodelay(true);
        http.enforce_http(false);
        http.set_connect_timeout(Some(PROBE_TIMEOUT));

        let tls = TlsConnector::new().expect("Failed to build TLS connector");
        let https = HttpsConnector::from((http, tls.into()));
        let client = HyperClient::builder(TokioExecutor::new()).build(https);

        let (stop_tx, stop_rx) = watch::channel(false);

        Self {
            backends,
            interval,
            client,
            stop_tx,
            stop_rx,
        }
    }

    /// Launch the background probe loop.
    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        let mut stop_rx = self.stop_rx.clone();

        tokio::spawn(async move {
            info!(
                interval_secs = self.interval.as_secs(),
                backends = self.backends.len(),
                "health checker started"
            );

            let mut ticker = tokio::time::interval(self.interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => self.check_all(),
                    _ = stop_rx.changed() => {
                        info!("health checker stopped");
                        break;
                    }
                }
            }
        })
    }

    /// Signal the probe loop to exit. Probes already in flight complete, but
    /// no further rounds are scheduled.
    pub fn stop(&self) {
        let _ = self.stop_tx.send(true);
    }

    /// Fan out one probe sub-task per backend.
    fn check_all(&self) {
        for backend in &self.backends {
            let client = self.client.clone();
            let backend = Arc::clone(backend);
            tokio::spawn(async move {
                probe(&client, &backend).await;
            });
        }
    }
}

/// Probe a single backend and update its health flag.
async fn probe(client: &ProbeClient, backend: &Arc<Backend>) {
    let url = format!("{}/health", backend.url().trim_end_matches('/'));

    let healthy = match tokio::time::timeout(PROBE_TIMEOUT, fetch_status(client, &url)).await {
        Ok(Ok(status)) => {
            debug!(backend = %backend.url(), status = status.as_u16(), "health probe");
            status.as_u16() < 400
        }
        Ok(Err(e)) => {
            debug!(backend = %backend.url(), error = %e, "health probe failed");
            false
        }
        Err(_) => {
            debug!(backend = %backend.url(), "health probe timed out");
            false
        }
    };

    if healthy != backend.is_healthy() {
        if healthy {
            info!(backend = %backend.url(), "backend recovered");
        } else {
            warn!(backend = %backend.url(), "backend marked unhealthy");
        }
    }
    backend.set_health(healthy);
}

async fn fetch_status(client: &ProbeClient, url: &str) -> anyhow::Result<StatusCode> {
    let uri: Uri = url.parse()?;
    let req = Request::builder()
        .method(Method::GET)
        .uri(uri)
        .body(Empty::new())?;

    let resp = client.request(req).await?;
    Ok(resp.status())
}
