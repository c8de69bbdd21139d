// SPDX-License-Identifier: Apache-2.0

//! C8: Poller — the worker's outermost loop. Periodically asks the
//! coordinator for work and runs it to completion via `JobExecutor`.

use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{coordinator::Coordinator, job_executor::JobExecutor, token_source::TokenSource};

pub struct Poller {
    coordinator: Arc<dyn Coordinator>,
    executor: JobExecutor,
    tokens: TokenSource,
    period: Duration,
}

impl Poller {
    pub fn new(coordinator: Arc<dyn Coordinator>, executor: JobExecutor, tokens: TokenSource, period: Duration) -> Self {
        Self {
            coordinator,
            executor,
            tokens,
            period,
        }
    }

    /// Runs until `cancel` fires. Each tick: ask for a job; if one is
    /// available, run it to completion inline (the executor itself fans
    /// the archives within it out concurrently, bounded by `tokens`); sleep
    /// for the remainder of the period regardless of outcome. A job's own
    /// error is logged, never propagated — the poller keeps polling.
    pub async fn run(&self, cancel: &CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                return;
            }

            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                next = self.coordinator.next_job() => next,
            };

            match next {
                Ok(Some(job)) => {
                    let job_id = job.id.clone();
                    if let Err(err) = self.executor.run(job, self.tokens.clone(), cancel).await {
                        tracing::warn!(job_id, error = %err, "job failed");
                    }
                }
                Ok(None) => {
                    tracing::debug!("no work available");
                }
                Err(err) => {
                    tracing::warn!(error = %err, "failed to fetch next job");
                }
            }

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return,
                _ = tokio::time::sleep(self.period) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use object_store::memory::InMemory;

    use super::*;
    use crate::{
        archive_reader::ReaderOptions,
        errors::GardenerError,
        model::{Job, JobState},
        task_runner::Parser,
    };

    struct CountingCoordinator {
        calls: AtomicUsize,
        updates: std::sync::Mutex<Vec<(String, JobState)>>,
    }

    #[async_trait]
    impl Coordinator for CountingCoordinator {
        async fn next_job(&self) -> Result<Option<Job>, GardenerError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Ok(Some(Job {
                    id: "job-1".to_string(),
                    experiment: "ndt".to_string(),
                    datatype: "ndt".to_string(),
                    date: chrono::NaiveDate::from_ymd_opt(2024, 1, 2).unwrap(),
                    bucket: "archives".to_string(),
                    prefix: "ndt/ndt/".to_string(),
                    key_filter: ".*".to_string(),
                }))
            } else {
                Ok(None)
            }
        }

        async fn heartbeat(&self, _job_id: &str) -> Result<(), GardenerError> {
            Ok(())
        }

        async fn update(&self, job_id: &str, state: JobState, _detail: &str) -> Result<(), GardenerError> {
            self.updates.lock().unwrap().push((job_id.to_string(), state));
            Ok(())
        }
    }

    struct NoopParser;

    #[async_trait]
    impl Parser for NoopParser {
        async fn parse_and_insert(
            &self,
            _archive: &crate::model::ArchiveDescriptor,
            _name: &str,
            _content: bytes::Bytes,
        ) -> Result<(), GardenerError> {
            Ok(())
        }

        async fn flush(&self, _archive: &crate::model::ArchiveDescriptor) -> Result<(), GardenerError> {
            Ok(())
        }

        async fn close(&self) -> Result<(), GardenerError> {
            Ok(())
        }

        fn table_name(&self) -> &str {
            "noop"
        }
    }

    #[tokio::test]
    async fn polls_once_then_idles_until_canceled() {
        let coordinator = Arc::new(CountingCoordinator {
            calls: AtomicUsize::new(0),
            updates: std::sync::Mutex::new(Vec::new()),
        });
        let store = Arc::new(InMemory::new());
        let tokens = TokenSource::new(2);
        let parser_factory: crate::job_executor::ParserFactory =
            Arc::new(|_job| Ok(Arc::new(NoopParser) as Arc<dyn Parser>));
        let executor = JobExecutor::new(
            coordinator.clone(),
            store,
            ReaderOptions::default(),
            parser_factory,
            Duration::from_secs(30),
        );
        let poller = Poller::new(coordinator.clone(), executor, tokens, Duration::from_millis(5));

        let cancel = CancellationToken::new();
        let cancel_clone = cancel.clone();
        let handle = tokio::spawn(async move { poller.run(&cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert!(coordinator.calls.load(Ordering::SeqCst) >= 2);
        // Completion update is posted from a detached task; give it a beat.
        tokio::time::sleep(Duration::from_millis(20)).await;
        let updates = coordinator.updates.lock().unwrap();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].1, JobState::Parsing);
        assert_eq!(updates[1].1, JobState::ParseComplete);
    }
}
