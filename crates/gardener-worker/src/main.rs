// SPDX-License-Identifier: Apache-2.0

use std::{net::SocketAddr, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use gardener_core::{Coordinator, GardenerError, Job, JobExecutor, Poller, Sink, TokenSource};
use gardener_sinks::{ObjectStoreSink, WarehouseSink};
use gardener_worker::{GardenerClient, NdtParser, OutputMode, SinkFactory, StatusPage, WorkerConfig};
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

gardener_bin_version::bin_version!();

fn setup_env(token: CancellationToken) {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic| {
        default_hook(panic);
        std::process::exit(12);
    }));

    tokio::spawn(async move {
        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("cannot listen to SIGTERM signal")
                .recv()
                .await;
        };
        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = tokio::signal::ctrl_c() => tracing::info!("CTRL+C signal received, shutting down"),
            _ = terminate => tracing::info!("SIGTERM signal received, shutting down"),
        };
        token.cancel();
    });
}

fn set_up_logging() {
    tracing_subscriber::registry()
        .with(EnvFilter::from_default_env())
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Builds the `Sink` for one session (one archive under `Archive` scope,
/// one job under `Job` scope), per `config.output`. `local-file` reuses
/// `ObjectStoreSink` against a `file://` store rooted at `output_location`,
/// since writing line-delimited JSON to a local directory is the same
/// algorithm as writing it to a bucket. Warehouse output ignores
/// `object_key` entirely: every session for a job lands in the same
/// partitioned table regardless of scope, so opening several independent
/// `WarehouseSink`s under `Archive` scope is just several open/commit/close
/// cycles against that one target.
fn build_sink(
    config: &WorkerConfig,
    bigquery: Option<Arc<gcp_bigquery_client::Client>>,
    object_key: &str,
    date: chrono::NaiveDate,
) -> Result<Arc<dyn Sink>, GardenerError> {
    match config.output {
        OutputMode::Warehouse => {
            let client = bigquery
                .ok_or_else(|| GardenerError::Fatal("warehouse output selected without BigQuery credentials".to_string()))?;
            Ok(Arc::new(WarehouseSink::new(
                client,
                config.warehouse_project.clone(),
                config.warehouse_dataset.clone(),
                &config.warehouse_table,
                date,
                config.batch_service,
            )))
        }
        OutputMode::ObjectStore | OutputMode::LocalFile => {
            let url = url::Url::parse(&config.output_location)
                .map_err(|e| GardenerError::InvalidInput(format!("bad output_location URL {}: {e}", config.output_location)))?;
            let (store, _path) = object_store::parse_url(&url)?;
            Ok(Arc::new(ObjectStoreSink::new(Arc::from(store), object_key)))
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    set_up_logging();

    let config = WorkerConfig::parse();
    tracing::info!(?config, version = VERSION, git_revision = GIT_REVISION, "starting gardener-worker");

    let token = CancellationToken::new();
    let job_token = token.child_token();
    setup_env(token.clone());

    let metrics_addr: SocketAddr = format!("{}:{}", config.metrics_host, config.metrics_port).parse()?;
    let registry_service = gardener_metrics::start_prometheus_server(metrics_addr);
    gardener_metrics::init_metrics(&registry_service.default_registry());
    gardener_metrics::spawn_uptime_ticker({
        let token = token.clone();
        async move { token.cancelled().await }
    });

    let service_addr: SocketAddr = format!("{}:{}", config.service_host, config.service_port).parse()?;
    let output_destination = match config.output {
        OutputMode::Warehouse => format!("bigquery:{}.{}.{}", config.warehouse_project, config.warehouse_dataset, config.warehouse_table),
        OutputMode::ObjectStore | OutputMode::LocalFile => config.output_location.clone(),
    };
    gardener_worker::control::spawn(
        service_addr,
        StatusPage {
            version: VERSION,
            git_revision: GIT_REVISION,
            output_destination,
        },
    );

    if config.passive_mode() {
        tracing::info!("gardener_addr is empty, running in passive mode: control surface only");
        token.cancelled().await;
        return Ok(());
    }

    let archive_url = url::Url::parse(&config.archive_store_url)?;
    let (archive_store, _path) = object_store::parse_url(&archive_url)?;
    let archive_store: Arc<dyn ObjectStore> = Arc::from(archive_store);

    let bigquery = if matches!(config.output, OutputMode::Warehouse) {
        Some(Arc::new(gcp_bigquery_client::Client::from_application_default_credentials().await?))
    } else {
        None
    };

    let worker_config = Arc::new(config.clone());
    let parser_factory: gardener_core::ParserFactory = {
        let worker_config = worker_config.clone();
        Arc::new(move |job: &Job| -> Result<Arc<dyn gardener_core::Parser>, GardenerError> {
            let worker_config = worker_config.clone();
            let bigquery = bigquery.clone();
            let date = job.date;
            // Under `Job` scope the session key NdtParser hands back is
            // always empty, so the object-store key falls back to a
            // per-job path instead of a per-archive one.
            let job_fallback_key = format!("{}/{}/{}", job.experiment, job.datatype, job.date);
            let sink_factory: SinkFactory = Arc::new(move |session_key: &str| {
                let object_key = if session_key.is_empty() { job_fallback_key.clone() } else { session_key.to_string() };
                build_sink(&worker_config, bigquery.clone(), &object_key, date)
            });
            let label_prefix = format!("{}-{}", job.experiment, job.datatype);
            Ok(Arc::new(NdtParser::new(sink_factory, label_prefix, worker_config.ndt_omit_deltas, worker_config.sink_scope)))
        })
    };

    let coordinator: Arc<dyn Coordinator> = Arc::new(GardenerClient::new(&config.gardener_addr));
    let tokens = TokenSource::new(config.max_active);
    let executor = JobExecutor::new(
        coordinator.clone(),
        archive_store,
        Default::default(),
        parser_factory,
        Duration::from_secs(config.heartbeat_interval_secs),
    );
    let poller = Poller::new(coordinator, executor, tokens, Duration::from_secs(config.poll_interval_secs));

    let mut poller_task = tokio::spawn(async move { poller.run(&job_token).await });

    tokio::select! {
        _ = &mut poller_task => {}
        _ = token.cancelled() => {
            tracing::info!(timeout_secs = config.shutdown_timeout_secs, "shutting down, draining in-flight work");
            if tokio::time::timeout(Duration::from_secs(config.shutdown_timeout_secs), poller_task).await.is_err() {
                tracing::warn!("shutdown timeout exceeded, exiting without a full drain");
            }
        }
    }

    Ok(())
}
