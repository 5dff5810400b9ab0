use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Process-wide counters for the prediction workflow.
///
/// Cheap to clone; every clone shares the same counters.
#[derive(Clone)]
pub struct Metrics {
    inner: Arc<MetricsInner>,
}

struct MetricsInner {
    // Request Metrics
    single_requests: AtomicUsize,
    batch_requests: AtomicUsize,
    requests_failed: AtomicUsize,

    // Image Metrics
    images_succeeded: AtomicUsize,
    images_failed: AtomicUsize,
    inference_duration_ms: RwLock<Vec<u64>>,
    publish_duration_ms: RwLock<Vec<u64>>,

    // Per-endpoint request counters
    endpoint_counters: DashMap<String, AtomicUsize>,

    start_time: Instant,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(MetricsInner {
                single_requests: AtomicUsize::new(0),
                batch_requests: AtomicUsize::new(0),
                requests_failed: AtomicUsize::new(0),
                images_succeeded: AtomicUsize::new(0),
                images_failed: AtomicUsize::new(0),
                inference_duration_ms: RwLock::new(Vec::new()),
                publish_duration_ms: RwLock::new(Vec::new()),
                endpoint_counters: DashMap::new(),
                start_time: Instant::now(),
            }),
        }
    }

    // Request Metrics
    pub fn record_single_request(&self) {
        self.inner.single_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_batch_request(&self) {
        self.inner.batch_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_request_failed(&self) {
        self.inner.requests_failed.fetch_add(1, Ordering::Relaxed);
    }

    // Image Metrics
    pub fn record_image(&self, success: bool) {
        if success {
            self.inner.images_succeeded.fetch_add(1, Ordering::Relaxed);
        } else {
            self.inner.images_failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_inference_duration(&self, duration: Duration) {
        self.inner
            .inference_duration_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    pub fn record_publish_duration(&self, duration: Duration) {
        self.inner
            .publish_duration_ms
            .write()
            .push(duration.as_millis() as u64);
    }

    // Endpoint Metrics
    pub fn record_endpoint_request(&self, endpoint: &str) {
        self.inner
            .endpoint_counters
            .entry(endpoint.to_string())
            .or_insert_with(|| AtomicUsize::new(0))
            .fetch_add(1, Ordering::Relaxed);
    }

    pub fn endpoint_count(&self, endpoint: &str) -> usize {
        self.inner
            .endpoint_counters
            .get(endpoint)
            .map(|c| c.load(Ordering::Relaxed))
            .unwrap_or(0)
    }

    // Get snapshot for reporting
    pub fn snapshot(&self) -> MetricsSnapshot {
        let inference = self.inner.inference_duration_ms.read();
        let inference_avg = avg(&inference);
        let inference_p50 = percentile(&inference, 0.5);
        let inference_p95 = percentile(&inference, 0.95);
        let inference_p99 = percentile(&inference, 0.99);
        drop(inference);

        let publish = self.inner.publish_duration_ms.read();
        let publish_avg = avg(&publish);
        drop(publish);

        let images_succeeded = self.inner.images_succeeded.load(Ordering::Relaxed);
        let images_failed = self.inner.images_failed.load(Ordering::Relaxed);
        let images_total = images_succeeded + images_failed;
        let image_success_rate = if images_total > 0 {
            images_succeeded as f64 / images_total as f64
        } else {
            0.0
        };

        let mut endpoints: Vec<(String, usize)> = self
            .inner
            .endpoint_counters
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().load(Ordering::Relaxed)))
            .collect();
        endpoints.sort();

        MetricsSnapshot {
            single_requests: self.inner.single_requests.load(Ordering::Relaxed),
            batch_requests: self.inner.batch_requests.load(Ordering::Relaxed),
            requests_failed: self.inner.requests_failed.load(Ordering::Relaxed),
            images_succeeded,
            images_failed,
            image_success_rate,
            inference_avg_ms: inference_avg,
            inference_p50_ms: inference_p50,
            inference_p95_ms: inference_p95,
            inference_p99_ms: inference_p99,
            publish_avg_ms: publish_avg,
            endpoints,
            uptime_seconds: self.inner.start_time.elapsed().as_secs(),
        }
    }

    /// Generate Prometheus-format metrics
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        let mut out = format!(
            r#"# HELP predict_requests_total Prediction requests by input shape
# TYPE predict_requests_total counter
predict_requests_total {{mode="single"}} {}
predict_requests_total {{mode="batch"}} {}

# HELP predict_requests_failed_total Prediction requests that returned an error
# TYPE predict_requests_failed_total counter
predict_requests_failed_total {{}} {}

# HELP images_processed_total Images run through the model
# TYPE images_processed_total counter
images_processed_total {{outcome="success"}} {}
images_processed_total {{outcome="failure"}} {}

# HELP inference_duration_ms Inference latency in milliseconds
# TYPE inference_duration_ms gauge
inference_duration_ms {{stat="avg"}} {}
inference_duration_ms {{stat="p50"}} {}
inference_duration_ms {{stat="p95"}} {}
inference_duration_ms {{stat="p99"}} {}

# HELP publish_avg_duration_ms Average result publish latency in milliseconds
# TYPE publish_avg_duration_ms gauge
publish_avg_duration_ms {{}} {}

# HELP uptime_seconds Application uptime in seconds
# TYPE uptime_seconds counter
uptime_seconds {{}} {}
"#,
            snapshot.single_requests,
            snapshot.batch_requests,
            snapshot.requests_failed,
            snapshot.images_succeeded,
            snapshot.images_failed,
            snapshot.inference_avg_ms,
            snapshot.inference_p50_ms,
            snapshot.inference_p95_ms,
            snapshot.inference_p99_ms,
            snapshot.publish_avg_ms,
            snapshot.uptime_seconds,
        );

        if !snapshot.endpoints.is_empty() {
            out.push_str("\n# HELP http_requests_total Requests per endpoint\n");
            out.push_str("# TYPE http_requests_total counter\n");
            for (endpoint, count) in &snapshot.endpoints {
                out.push_str(&format!(
                    "http_requests_total {{endpoint=\"{}\"}} {}\n",
                    endpoint, count
                ));
            }
        }
        out
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub single_requests: usize,
    pub batch_requests: usize,
    pub requests_failed: usize,
    pub images_succeeded: usize,
    pub images_failed: usize,
    pub image_success_rate: f64,
    pub inference_avg_ms: u64,
    pub inference_p50_ms: u64,
    pub inference_p95_ms: u64,
    pub inference_p99_ms: u64,
    pub publish_avg_ms: u64,
    pub endpoints: Vec<(String, usize)>,
    pub uptime_seconds: u64,
}

fn percentile(values: &[u64], p: f64) -> u64 {
    if values.is_empty() {
        return 0;
    }
    let mut sorted = values.to_vec();
    sorted.sort_unstable();
    let idx = ((values.len() as f64 - 1.0) * p) as usize;
    sorted[idx]
}

fn avg(values: &[u64]) -> u64 {
    if values.is_empty() {
        return 0;
    }
    values.iter().sum::<u64>() / values.len() as u64
}
