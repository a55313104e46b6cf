use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::collections::HashSet;
use std::sync::{Mutex, OnceLock};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

static GLOBAL: OnceLock<Metrics> = OnceLock::new();

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the metrics
/// endpoint. Custom counters and summaries requested by transformers and
/// sidecars are namespaced and described exactly once; the name set is
/// guarded by a mutex so concurrent first-use cannot race a duplicate
/// registration.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
    namespace: String,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Idempotent: a second install (tests) reuses the
    /// already-installed recorder.
    pub fn install(namespace: &str) -> Self {
        let installed = GLOBAL.get_or_init(|| {
            let handle = PrometheusBuilder::new()
                .set_buckets_for_metric(
                    metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                    LATENCY_BUCKETS,
                )
                .expect("valid matcher")
                .install_recorder()
                .expect("failed to install metrics recorder");

            describe_counter!(
                "gateway_http_requests_total",
                Unit::Count,
                "Total HTTP requests processed"
            );
            describe_histogram!(
                "gateway_http_request_duration_seconds",
                Unit::Seconds,
                "Total request duration from client perspective"
            );
            describe_gauge!(
                "gateway_http_requests_in_flight",
                Unit::Count,
                "Number of requests currently being processed"
            );
            describe_counter!(
                "gateway_connections_total",
                Unit::Count,
                "Total connections accepted"
            );
            describe_gauge!(
                "gateway_connections_active",
                Unit::Count,
                "Number of active downstream connections"
            );

            Self {
                handle,
                namespace: namespace.to_string(),
            }
        });

        let metrics = Self {
            handle: installed.handle.clone(),
            namespace: namespace.to_string(),
        };

        // The counter every unmapped 5xx failure lands on.
        describe_counter!(
            metrics.scoped("internal_errors"),
            Unit::Count,
            "Unhandled, unexpected internal errors"
        );

        metrics
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    fn scoped(&self, name: &str) -> String {
        if self.namespace.is_empty() {
            name.to_string()
        } else {
            format!("{}_{}", self.namespace, name)
        }
    }

    pub fn internal_error(&self) {
        metrics::counter!(self.scoped("internal_errors")).increment(1);
    }

    /// Namespaced counter for plugin use, described on first request.
    pub fn custom_counter(&self, name: &str) -> metrics::Counter {
        let scoped = self.scoped(name);
        describe_once(&scoped, Kind::Counter);
        metrics::counter!(scoped)
    }

    /// Namespaced summary for plugin use. Rendered by the exporter as a
    /// Prometheus summary since no buckets are configured for it.
    pub fn custom_summary(&self, name: &str) -> metrics::Histogram {
        let scoped = self.scoped(name);
        describe_once(&scoped, Kind::Summary);
        metrics::histogram!(scoped)
    }
}

enum Kind {
    Counter,
    Summary,
}

fn describe_once(name: &str, kind: Kind) {
    static DESCRIBED: OnceLock<Mutex<HashSet<String>>> = OnceLock::new();
    let described = DESCRIBED.get_or_init(|| Mutex::new(HashSet::new()));
    let mut guard = described.lock().expect("metrics name registry poisoned");
    if guard.insert(name.to_string()) {
        match kind {
            Kind::Counter => describe_counter!(name.to_string(), "custom plugin counter"),
            Kind::Summary => describe_histogram!(name.to_string(), "custom plugin summary"),
        }
    }
}

/// Process-wide accessor for plugin code; a no-op recorder applies when
/// `Metrics::install` has not run (unit tests).
pub fn custom_counter(name: &str) -> metrics::Counter {
    match GLOBAL.get() {
        Some(m) => m.custom_counter(name),
        None => metrics::counter!(name.to_string()),
    }
}

pub fn custom_summary(name: &str) -> metrics::Histogram {
    match GLOBAL.get() {
        Some(m) => m.custom_summary(name),
        None => metrics::histogram!(name.to_string()),
    }
}

pub fn internal_error() {
    if let Some(m) = GLOBAL.get() {
        m.internal_error();
    }
}
