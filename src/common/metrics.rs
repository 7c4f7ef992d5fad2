//! Prometheus-compatible metrics
//!
//! Request latency histograms per route plus counters for the versioned
//! write path (records created, conflicts retried, batch failures).

use std::collections::HashMap;
use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// Upper bounds (ms) of the request latency buckets. A push holding a
/// whole batch can run up to its 30s deadline, hence the long tail.
const LATENCY_BUCKETS_MS: [f64; 12] = [
    1.0, 5.0, 10.0, 25.0, 50.0, 100.0, 250.0, 500.0, 1000.0, 5000.0, 10000.0, 30000.0,
];

/// Request latency distribution for one route
#[derive(Debug)]
pub struct Histogram {
    bounds_ms: &'static [f64],
    /// Per-bucket hits; the extra last slot counts everything above the top bound
    hits: Vec<AtomicU64>,
    total_micros: AtomicU64,
    observations: AtomicU64,
}

impl Histogram {
    pub fn new() -> Self {
        Self {
            bounds_ms: &LATENCY_BUCKETS_MS,
            hits: (0..=LATENCY_BUCKETS_MS.len())
                .map(|_| AtomicU64::new(0))
                .collect(),
            total_micros: AtomicU64::new(0),
            observations: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, elapsed: Duration) {
        let ms = elapsed.as_secs_f64() * 1000.0;
        let slot = self
            .bounds_ms
            .iter()
            .position(|&bound| ms <= bound)
            .unwrap_or(self.bounds_ms.len());

        self.hits[slot].fetch_add(1, Ordering::Relaxed);
        self.total_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.observations.fetch_add(1, Ordering::Relaxed);
    }

    /// Cumulative `(le, count)` pairs in Prometheus order, ending with +Inf
    pub fn get_buckets(&self) -> Vec<(f64, u64)> {
        let bounds = self
            .bounds_ms
            .iter()
            .copied()
            .chain(std::iter::once(f64::INFINITY));
        let mut running = 0u64;
        bounds
            .zip(&self.hits)
            .map(|(le, hits)| {
                running += hits.load(Ordering::Relaxed);
                (le, running)
            })
            .collect()
    }

    /// Total observed time in milliseconds
    pub fn sum(&self) -> f64 {
        self.total_micros.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn count(&self) -> u64 {
        self.observations.load(Ordering::Relaxed)
    }
}

impl Default for Histogram {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic event count (records created, conflicts retried, ...)
#[derive(Debug, Default)]
pub struct Counter(AtomicU64);

impl Counter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn inc(&self) {
        self.add(1);
    }

    pub fn add(&self, n: u64) {
        self.0.fetch_add(n, Ordering::Relaxed);
    }

    pub fn get(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

/// Per-route metrics
#[derive(Debug, Default)]
pub struct EndpointMetrics {
    pub requests_total: Counter,
    pub requests_error: Counter,
    pub latency: Histogram,
}

#[derive(Debug)]
pub struct MetricsRegistry {
    endpoints: Mutex<HashMap<String, Arc<EndpointMetrics>>>,

    pub total_requests: Counter,
    pub total_errors: Counter,

    pub deployments_created: Counter,
    pub batch_items_failed: Counter,
    pub version_conflicts: Counter,
    pub store_timeouts: Counter,
    pub status_updates: Counter,

    start_time: Instant,
}

impl MetricsRegistry {
    pub fn new() -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            total_requests: Counter::new(),
            total_errors: Counter::new(),
            deployments_created: Counter::new(),
            batch_items_failed: Counter::new(),
            version_conflicts: Counter::new(),
            store_timeouts: Counter::new(),
            status_updates: Counter::new(),
            start_time: Instant::now(),
        }
    }

    /// Get or create metrics for a route
    pub fn endpoint(&self, path: &str) -> Arc<EndpointMetrics> {
        let mut endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        endpoints.entry(path.to_string()).or_default().clone()
    }

    pub fn record_request(&self, path: &str, duration: Duration, success: bool) {
        let endpoint = self.endpoint(path);
        endpoint.requests_total.inc();
        endpoint.latency.observe(duration);
        self.total_requests.inc();

        if !success {
            endpoint.requests_error.inc();
            self.total_errors.inc();
        }
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }

    /// Routes seen so far, sorted by path
    fn endpoint_snapshot(&self) -> Vec<(String, Arc<EndpointMetrics>)> {
        let endpoints = self
            .endpoints
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let mut routes: Vec<_> = endpoints
            .iter()
            .map(|(path, m)| (path.clone(), m.clone()))
            .collect();
        routes.sort_by(|a, b| a.0.cmp(&b.0));
        routes
    }

    /// Render all metrics in Prometheus text format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::new();

        let counters: [(&str, &str, &Counter); 7] = [
            ("requests_total", "Total number of HTTP requests", &self.total_requests),
            ("errors_total", "Total number of failed HTTP requests", &self.total_errors),
            ("deployments_created_total", "Deployment records created", &self.deployments_created),
            ("batch_items_failed_total", "Push items that failed", &self.batch_items_failed),
            ("version_conflicts_total", "Version allocation conflicts retried", &self.version_conflicts),
            ("store_timeouts_total", "Store operations that hit their deadline", &self.store_timeouts),
            ("status_updates_total", "Deployment status transitions", &self.status_updates),
        ];
        for (name, help, counter) in counters {
            write_header(&mut out, name, help, "counter");
            let _ = writeln!(out, "deployctl_{} {}", name, counter.get());
        }

        write_header(&mut out, "uptime_seconds", "Server uptime in seconds", "gauge");
        let _ = writeln!(out, "deployctl_uptime_seconds {}", self.uptime_seconds());

        let routes = self.endpoint_snapshot();

        write_header(&mut out, "endpoint_requests_total", "Requests per route", "counter");
        for (path, m) in &routes {
            let _ = writeln!(
                out,
                "deployctl_endpoint_requests_total{{path=\"{}\"}} {}",
                path,
                m.requests_total.get()
            );
        }

        write_header(&mut out, "endpoint_errors_total", "Server errors per route", "counter");
        for (path, m) in &routes {
            let _ = writeln!(
                out,
                "deployctl_endpoint_errors_total{{path=\"{}\"}} {}",
                path,
                m.requests_error.get()
            );
        }

        write_header(
            &mut out,
            "request_duration_ms",
            "Request duration in milliseconds",
            "histogram",
        );
        for (path, m) in &routes {
            for (le, count) in m.latency.get_buckets() {
                let le = if le.is_infinite() {
                    "+Inf".to_string()
                } else {
                    le.to_string()
                };
                let _ = writeln!(
                    out,
                    "deployctl_request_duration_ms_bucket{{path=\"{}\",le=\"{}\"}} {}",
                    path, le, count
                );
            }
            let _ = writeln!(
                out,
                "deployctl_request_duration_ms_sum{{path=\"{}\"}} {}\n\
                 deployctl_request_duration_ms_count{{path=\"{}\"}} {}",
                path,
                m.latency.sum(),
                path,
                m.latency.count()
            );
        }

        out
    }
}

fn write_header(out: &mut String, name: &str, help: &str, kind: &str) {
    let _ = writeln!(out, "# HELP deployctl_{} {}", name, help);
    let _ = writeln!(out, "# TYPE deployctl_{} {}", name, kind);
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Global metrics instance
pub static METRICS: once_cell::sync::Lazy<MetricsRegistry> =
    once_cell::sync::Lazy::new(MetricsRegistry::new);
