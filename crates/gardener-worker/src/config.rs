// SPDX-License-Identifier: Apache-2.0

//! `WorkerConfig` — every flag named in the worker's configuration surface,
//! parsed with `clap`.

use std::net::IpAddr;

use clap::{Parser, ValueEnum};

/// Where committed rows land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
#[clap(rename_all = "kebab-case")]
pub enum OutputMode {
    Warehouse,
    ObjectStore,
    LocalFile,
}

/// Per-archive vs per-job `Sink` session lifetime (Open Question #1,
/// resolved as a configuration flag defaulting to the simpler per-archive
/// ownership).
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
#[clap(rename_all = "kebab-case")]
pub enum SinkScope {
    #[default]
    Archive,
    Job,
}

#[derive(Parser, Debug, Clone)]
#[command(name = "gardener-worker", about = "Worker half of the Gardener ETL pipeline", version)]
pub struct WorkerConfig {
    /// Destination kind for committed rows.
    #[arg(long, value_enum, default_value_t = OutputMode::ObjectStore)]
    pub output: OutputMode,

    /// Destination identifier for non-warehouse output modes: a bucket/key
    /// prefix for `object-store`, a directory for `local-file`. Ignored for
    /// `warehouse` output, which instead uses `warehouse_project`/
    /// `warehouse_dataset`/`warehouse_table`.
    #[arg(long, default_value = "")]
    pub output_location: String,

    /// BigQuery project id, used only when `output = warehouse`.
    #[arg(long, default_value = "")]
    pub warehouse_project: String,

    /// BigQuery dataset id, used only when `output = warehouse`.
    #[arg(long, default_value = "")]
    pub warehouse_dataset: String,

    /// BigQuery table name (unqualified; the partition suffix/decorator is
    /// computed from each job's date), used only when `output = warehouse`.
    #[arg(long, default_value = "")]
    pub warehouse_table: String,

    /// TokenSource capacity: maximum archives processed concurrently.
    #[arg(long, default_value_t = 8)]
    pub max_active: usize,

    /// `host:port` of the coordinator. Empty means passive mode: the
    /// worker never polls and only serves its control surface.
    #[arg(long, default_value = "")]
    pub gardener_addr: String,

    /// Listen address for the worker's own control HTTP surface.
    #[arg(long, default_value = "0.0.0.0")]
    pub service_host: IpAddr,

    /// Listen port for the worker's own control HTTP surface.
    #[arg(long, default_value_t = 8080)]
    pub service_port: u16,

    /// Host the Prometheus `/metrics` endpoint binds to.
    #[arg(long, default_value = "0.0.0.0")]
    pub metrics_host: IpAddr,

    /// Port the Prometheus `/metrics` endpoint binds to.
    #[arg(long, default_value_t = 9090)]
    pub metrics_port: u16,

    /// Grace period allowed for in-flight TaskRunners to drain on shutdown.
    #[arg(long, default_value_t = 30)]
    pub shutdown_timeout_secs: u64,

    /// Poller outer-loop period (spec.md §4.8's period T).
    #[arg(long, default_value_t = 10)]
    pub poll_interval_secs: u64,

    /// Wall-clock heartbeat cadence, independent of archive dispatch
    /// events (spec.md §9, Open Question #2).
    #[arg(long, default_value_t = 30)]
    pub heartbeat_interval_secs: u64,

    /// NDT-parser-specific toggle, passed through to `NdtParser` untouched.
    #[arg(long, default_value_t = false)]
    pub ndt_omit_deltas: bool,

    /// Steers warehouse partitioning strategy: when true, recent-window
    /// rows still route to the template-suffixed table rather than the
    /// live partition decorator, matching a downstream batch merge
    /// pipeline's expectations.
    #[arg(long, default_value_t = false)]
    pub batch_service: bool,

    /// Sink session lifetime: one session per archive or one per job.
    #[arg(long, value_enum, default_value_t = SinkScope::Archive)]
    pub sink_scope: SinkScope,

    /// URL identifying the object store archives are read from (scheme
    /// selects the backend: `memory://`, `file://`, `s3://`, `gs://`,
    /// `az://`). Concrete object-store clients are out of this worker's
    /// scope beyond this one construction point.
    #[arg(long, default_value = "memory://")]
    pub archive_store_url: String,
}

impl WorkerConfig {
    pub fn passive_mode(&self) -> bool {
        self.gardener_addr.is_empty()
    }
}
