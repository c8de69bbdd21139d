// SPDX-License-Identifier: Apache-2.0

//! Prometheus registry plumbing and the worker's own control-surface metrics.
//!
//! `spawn_monitored_task!` and `RegistryService` are carried over near
//! verbatim from the indexing-pipeline metrics crate this workspace grew out
//! of; `GardenerMetrics` is new and holds the counters/gauges the job
//! execution subsystem reports against.

use std::{future::Future, net::SocketAddr, path::Path, pin::Pin, sync::Arc};

use axum::{Router, extract::Extension, http::StatusCode, routing::get};
use dashmap::DashMap;
use once_cell::sync::OnceCell;
use prometheus::{
    HistogramVec, IntCounterVec, IntGauge, Registry, TextEncoder,
    register_histogram_vec_with_registry, register_int_counter_vec_with_registry,
    register_int_gauge_with_registry,
};
use tap::TapFallible;
use tokio::task::JoinHandle;
use tracing::warn;
use uuid::Uuid;

#[macro_export]
macro_rules! monitored_future {
    ($fut: expr) => {{
        let location: &str = concat!(file!(), ':', line!());
        async move {
            let metrics = $crate::get_metrics();
            let _guard = metrics.map(|m| {
                m.tasks.with_label_values(&[location]).inc();
                $crate::scopeguard::guard(m, |m| {
                    m.tasks.with_label_values(&[location]).dec();
                })
            });
            $fut.await
        }
    }};
}

pub use scopeguard;

/// Spawns `$fut` on the runtime while tracking it in the `monitored_tasks`
/// gauge, labeled by call site. Mirrors the indexing pipeline's own
/// task-visibility convention so that a stuck or panicking TaskRunner shows
/// up in `/metrics` rather than vanishing silently.
#[macro_export]
macro_rules! spawn_monitored_task {
    ($fut: expr) => {
        tokio::task::spawn($crate::monitored_future!($fut))
    };
}

pub struct MonitoredScopeGuard {
    metrics: &'static GardenerMetrics,
    name: &'static str,
    timer: std::time::Instant,
}

impl Drop for MonitoredScopeGuard {
    fn drop(&mut self) {
        self.metrics
            .scope_duration_ns
            .with_label_values(&[self.name])
            .observe(self.timer.elapsed().as_nanos() as f64);
    }
}

/// Tracks total iterations and cumulative duration of a named scope, e.g. one
/// pass of the Poller's outer loop or one JobExecutor dispatch cycle.
pub fn monitored_scope(name: &'static str) -> Option<MonitoredScopeGuard> {
    get_metrics().map(|m| {
        m.scope_iterations.with_label_values(&[name]).inc();
        MonitoredScopeGuard {
            metrics: m,
            name,
            timer: std::time::Instant::now(),
        }
    })
}

/// Counters and gauges the job execution subsystem reports against. Field
/// names mirror the metric names used in the scenario descriptions this
/// worker is tested against: `files_processed`, `tasks{outcome}`,
/// `skipped_oversize`, `retry{reason}`, `splitting_buffer`, `quota_exceeded`.
#[derive(Debug)]
pub struct GardenerMetrics {
    pub tasks: IntCounterVec,
    pub scope_iterations: IntCounterVec,
    pub scope_duration_ns: HistogramVec,

    /// `files_processed{experiment, site, host, weekday}`
    pub files_processed: IntCounterVec,
    /// `tasks_outcome{outcome}` — OK | Error | Canceled
    pub tasks_outcome: IntCounterVec,
    /// entries dropped for exceeding `maxBytes`
    pub skipped_oversize: IntCounterVec,
    /// non-regular entries (directories, symlinks, ...) skipped unparsed
    pub skipped_non_regular: IntCounterVec,
    /// `retry{reason}` — unexpected_eof | read_error | quota_exceeded
    pub retry: IntCounterVec,
    /// times a Commit recursively split its row batch
    pub splitting_buffer: IntCounterVec,
    /// rows accepted by a Commit caller (`accepted += k`)
    pub rows_accepted: IntCounterVec,
    /// rows actually committed to the backend
    pub rows_committed: IntCounterVec,
    /// rows rejected per-row and absorbed into `bad`
    pub rows_bad: IntCounterVec,
    /// commits that failed outright (`failed += 1`)
    pub commits_failed: IntCounterVec,
    /// jobs currently in flight
    pub jobs_in_flight: IntGauge,
    /// process uptime in seconds, refreshed by a background tick
    pub uptime_seconds: IntGauge,
}

impl GardenerMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            tasks: register_int_counter_vec_with_registry!(
                "monitored_tasks",
                "Number of tasks spawned per callsite.",
                &["callsite"],
                registry,
            )
            .unwrap(),
            scope_iterations: register_int_counter_vec_with_registry!(
                "monitored_scope_iterations",
                "Number of times a monitored scope ran.",
                &["name"],
                registry,
            )
            .unwrap(),
            scope_duration_ns: register_histogram_vec_with_registry!(
                "monitored_scope_duration_ns",
                "Duration in nanoseconds of a monitored scope.",
                &["name"],
                registry,
            )
            .unwrap(),
            files_processed: register_int_counter_vec_with_registry!(
                "gardener_files_processed",
                "Archives fully processed by a TaskRunner.",
                &["experiment", "site", "host", "weekday"],
                registry,
            )
            .unwrap(),
            tasks_outcome: register_int_counter_vec_with_registry!(
                "gardener_tasks",
                "TaskRunner completions by outcome.",
                &["datatype", "outcome"],
                registry,
            )
            .unwrap(),
            skipped_oversize: register_int_counter_vec_with_registry!(
                "gardener_skipped_oversize",
                "Archive entries dropped for exceeding maxBytes.",
                &["datatype"],
                registry,
            )
            .unwrap(),
            skipped_non_regular: register_int_counter_vec_with_registry!(
                "gardener_skipped_non_regular",
                "Non-regular archive entries (directories, symlinks, ...) skipped unparsed.",
                &["datatype"],
                registry,
            )
            .unwrap(),
            retry: register_int_counter_vec_with_registry!(
                "gardener_retry",
                "Retried operations by reason.",
                &["reason"],
                registry,
            )
            .unwrap(),
            splitting_buffer: register_int_counter_vec_with_registry!(
                "gardener_splitting_buffer",
                "Commit row batches recursively split on PayloadTooLarge.",
                &["sink"],
                registry,
            )
            .unwrap(),
            rows_accepted: register_int_counter_vec_with_registry!(
                "gardener_rows_accepted",
                "Rows passed to Commit.",
                &["sink"],
                registry,
            )
            .unwrap(),
            rows_committed: register_int_counter_vec_with_registry!(
                "gardener_rows_committed",
                "Rows the backend confirmed accepted.",
                &["sink"],
                registry,
            )
            .unwrap(),
            rows_bad: register_int_counter_vec_with_registry!(
                "gardener_rows_bad",
                "Rows rejected per-row and absorbed into counters.",
                &["sink"],
                registry,
            )
            .unwrap(),
            commits_failed: register_int_counter_vec_with_registry!(
                "gardener_commits_failed",
                "Commit calls that failed outright.",
                &["sink"],
                registry,
            )
            .unwrap(),
            jobs_in_flight: register_int_gauge_with_registry!(
                "gardener_jobs_in_flight",
                "Jobs currently being executed.",
                registry,
            )
            .unwrap(),
            uptime_seconds: register_int_gauge_with_registry!(
                "gardener_uptime_seconds",
                "Seconds since process start.",
                registry,
            )
            .unwrap(),
        }
    }
}

static METRICS: OnceCell<GardenerMetrics> = OnceCell::new();

/// Initializes the global metrics instance. Intended to be called once
/// during startup; a second call is logged and ignored; this happens
/// routinely in tests that build more than one worker in-process.
pub fn init_metrics(registry: &Registry) {
    let _ = METRICS
        .set(GardenerMetrics::new(registry))
        .tap_err(|_| warn!("init_metrics registry overwritten"));
}

pub fn get_metrics() -> Option<&'static GardenerMetrics> {
    METRICS.get()
}

/// Spawns a background task that increments `uptime_seconds` once a second
/// until `shutdown` resolves. Substitutes for the closure-style uptime gauge
/// the indexing pipeline uses, whose backing crate is not vendored here.
pub fn spawn_uptime_ticker(
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut shutdown = Box::pin(shutdown);
        let mut interval = tokio::time::interval(std::time::Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Some(m) = get_metrics() {
                        m.uptime_seconds.inc();
                    }
                }
                _ = &mut shutdown => break,
            }
        }
    })
}

pub fn is_running_in_docker() -> bool {
    Path::new("/.dockerenv").exists()
}

pub type RegistryID = Uuid;

/// Manages the set of Prometheus registries a process exposes. Cloned freely;
/// the default registry is never removed.
#[derive(Clone)]
pub struct RegistryService {
    default_registry: Registry,
    registries_by_id: Arc<DashMap<Uuid, Registry>>,
}

impl RegistryService {
    pub fn new(default_registry: Registry) -> Self {
        Self {
            default_registry,
            registries_by_id: Arc::new(DashMap::new()),
        }
    }

    pub fn default_registry(&self) -> Registry {
        self.default_registry.clone()
    }

    pub fn add(&self, registry: Registry) -> RegistryID {
        let registry_id = Uuid::new_v4();
        if self
            .registries_by_id
            .insert(registry_id, registry)
            .is_some()
        {
            panic!("Other Registry already detected for the same id {registry_id}");
        }
        registry_id
    }

    pub fn remove(&self, registry_id: RegistryID) -> bool {
        self.registries_by_id.remove(&registry_id).is_some()
    }

    pub fn get_all(&self) -> Vec<Registry> {
        let mut registries: Vec<Registry> = self
            .registries_by_id
            .iter()
            .map(|r| r.value().clone())
            .collect();
        registries.push(self.default_registry.clone());
        registries
    }

    pub fn gather_all(&self) -> Vec<prometheus::proto::MetricFamily> {
        self.get_all().iter().flat_map(|r| r.gather()).collect()
    }
}

pub const METRICS_ROUTE: &str = "/metrics";

/// Starts the HTTP server backing the `/metrics` endpoint named in the
/// worker's control surface. Returns the `RegistryService` so callers can
/// register additional registries (e.g. one per job executor, mirroring how
/// the indexing pipeline scopes registries per pipeline stage).
pub fn start_prometheus_server(addr: SocketAddr) -> RegistryService {
    let registry = Registry::new();
    let registry_service = RegistryService::new(registry);

    let app = Router::new()
        .route(METRICS_ROUTE, get(metrics))
        .layer(Extension(registry_service.clone()));

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&addr).await.unwrap();
        axum::serve(listener, app.into_make_service())
            .await
            .unwrap();
    });

    registry_service
}

async fn metrics(Extension(registry_service): Extension<RegistryService>) -> (StatusCode, String) {
    let metrics_families = registry_service.gather_all();
    match TextEncoder.encode_to_string(&metrics_families) {
        Ok(metrics) => (StatusCode::OK, metrics),
        Err(error) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("unable to encode metrics: {error}"),
        ),
    }
}

// Kept for callers that want to pin a boxed future into a monitored scope,
// e.g. the Poller's outer tick.
pub type BoxedFuture<T> = Pin<Box<dyn Future<Output = T> + Send>>;

#[cfg(test)]
mod tests {
    use prometheus::{IntCounter, Registry};

    use crate::RegistryService;

    #[test]
    fn registry_service_tracks_add_and_remove() {
        let default_registry = Registry::new_custom(Some("default".to_string()), None).unwrap();
        let registry_service = RegistryService::new(default_registry.clone());
        let default_counter = IntCounter::new("counter", "counter_desc").unwrap();
        default_counter.inc();
        default_registry
            .register(Box::new(default_counter))
            .unwrap();

        let registry_1 = Registry::new_custom(Some("gardener".to_string()), None).unwrap();
        registry_1
            .register(Box::new(
                IntCounter::new("counter_1", "counter_1_desc").unwrap(),
            ))
            .unwrap();
        let registry_1_id = registry_service.add(registry_1);

        let mut metrics = registry_service.gather_all();
        metrics.sort_by(|m1, m2| Ord::cmp(m1.name(), m2.name()));
        assert_eq!(metrics.len(), 2);

        assert!(registry_service.remove(registry_1_id));
        assert_eq!(registry_service.gather_all().len(), 1);
    }
}
