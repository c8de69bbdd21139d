// SPDX-License-Identifier: Apache-2.0

//! C7: JobExecutor — per-job orchestration: acquire job, list archives,
//! dispatch TaskRunners in parallel, heartbeat, post completion.

use std::{sync::Arc, time::Duration};

use object_store::ObjectStore;
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{
    archive_listing::ArchiveListing,
    archive_reader::ReaderOptions,
    coordinator::Coordinator,
    errors::GardenerError,
    model::{Job, JobState},
    runnable_source::RunnableSource,
    task_runner::Parser,
    token_source::TokenSource,
};

/// Picks the parser (and whatever `Annotator`/`Sink` it is wired to) for a
/// job's datatype. Invoked once per job, never at a hot-path call site.
pub type ParserFactory = Arc<dyn Fn(&Job) -> Result<Arc<dyn Parser>, GardenerError> + Send + Sync>;

pub struct JobExecutor {
    coordinator: Arc<dyn Coordinator>,
    store: Arc<dyn ObjectStore>,
    reader_opts: ReaderOptions,
    parser_factory: ParserFactory,
    heartbeat_interval: Duration,
}

impl JobExecutor {
    pub fn new(
        coordinator: Arc<dyn Coordinator>,
        store: Arc<dyn ObjectStore>,
        reader_opts: ReaderOptions,
        parser_factory: ParserFactory,
        heartbeat_interval: Duration,
    ) -> Self {
        Self {
            coordinator,
            store,
            reader_opts,
            parser_factory,
            heartbeat_interval,
        }
    }

    /// Runs one job to completion: lists archives, dispatches a `TaskRunner`
    /// per archive (throttled by `tokens`), heartbeats on both a wall-clock
    /// timer and every dispatch, and posts a terminal `ParseComplete` /
    /// `ParseError` update after all in-flight runners finish.
    ///
    /// A transient listing error terminates the job (in-flight TaskRunners
    /// are still awaited); individual TaskRunner failures are counted, not
    /// surfaced here. Cancellation propagates down to every component and
    /// is itself returned as `GardenerError::Canceled`.
    pub async fn run(&self, job: Job, tokens: TokenSource, cancel: &CancellationToken) -> Result<(), GardenerError> {
        let filter = Regex::new(&job.key_filter)
            .map_err(|e| GardenerError::InvalidInput(format!("bad key_filter regex: {e}")))?;
        let parser = (self.parser_factory)(&job)?;
        let parser_for_close = parser.clone();

        let listing = ArchiveListing::new(self.store.as_ref(), job.bucket.clone(), &job.prefix, &filter).await;
        let mut source = RunnableSource::new(listing, tokens, self.store.clone(), self.reader_opts, parser);

        let _ = self.coordinator.update(&job.id, JobState::Parsing, "").await;

        if let Some(m) = gardener_metrics::get_metrics() {
            m.jobs_in_flight.inc();
        }

        let mut handles = Vec::new();
        let mut heartbeat_tick = tokio::time::interval(self.heartbeat_interval);
        heartbeat_tick.tick().await; // first tick fires immediately; consume it
        let mut terminal_err: Option<GardenerError> = None;

        loop {
            tokio::select! {
                _ = heartbeat_tick.tick() => {
                    let _ = self.coordinator.heartbeat(&job.id).await;
                }
                next = source.next(cancel) => {
                    match next {
                        Ok(Some(task)) => {
                            let _ = self.coordinator.heartbeat(&job.id).await;
                            let info = task.info();
                            let child = cancel.child_token();
                            let handle = gardener_metrics::spawn_monitored_task!(async move {
                                if let Err(err) = task.run(&child).await {
                                    tracing::warn!(archive = %info, error = %err, "task runner failed");
                                }
                            });
                            handles.push(handle);
                        }
                        Ok(None) => break,
                        Err(err) => {
                            terminal_err = Some(err);
                            break;
                        }
                    }
                }
            }
        }

        for handle in handles {
            let _ = handle.await;
        }

        if let Err(err) = parser_for_close.close().await {
            tracing::warn!(job_id = %job.id, error = %err, "sink close failed");
            if terminal_err.is_none() {
                terminal_err = Some(err);
            }
        }

        if let Some(m) = gardener_metrics::get_metrics() {
            m.jobs_in_flight.dec();
        }

        let (state, detail) = match &terminal_err {
            None => (JobState::ParseComplete, String::new()),
            Some(err) => (JobState::ParseError, classify(err)),
        };

        // Posted from a detached task so `run` itself returns as soon as
        // dispatch has drained, matching the coordinator's tolerance for a
        // best-effort completion signal arriving slightly late.
        let coordinator = self.coordinator.clone();
        let job_id = job.id.clone();
        gardener_metrics::spawn_monitored_task!(async move {
            post_completion_with_retry(coordinator, &job_id, state, &detail).await;
        });

        match terminal_err {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }
}

fn classify(err: &GardenerError) -> String {
    match err {
        GardenerError::Canceled => "canceled".to_string(),
        GardenerError::InvalidInput(_) => "invalid_input".to_string(),
        GardenerError::Transient(_) | GardenerError::ObjectStore(_) => "transient".to_string(),
        other => other.to_string(),
    }
}

/// The terminal completion update is retried once (two total attempts, a
/// short fixed gap) before being logged and dropped — losing it otherwise
/// leaves the job in limbo on the coordinator's side. Every other
/// coordinator call stays pure fire-and-forget.
async fn post_completion_with_retry(coordinator: Arc<dyn Coordinator>, job_id: &str, state: JobState, detail: &str) {
    if coordinator.update(job_id, state, detail).await.is_ok() {
        return;
    }
    tokio::time::sleep(Duration::from_secs(2)).await;
    if let Err(err) = coordinator.update(job_id, state, detail).await {
        tracing::warn!(job_id, %state, error = %err, "completion update dropped after retry");
    }
}
