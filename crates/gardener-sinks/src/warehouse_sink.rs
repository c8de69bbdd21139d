// SPDX-License-Identifier: Apache-2.0

//! Warehouse `Sink`: streams rows into a BigQuery-style table via
//! `tabledata().insert_all`, with `SkipInvalidRows` enabled so a single
//! malformed row never rejects the whole payload.
//!
//! Partition selection happens once at construction, from the job's date:
//! dates within the recent window go straight to the partition decorator
//! (`table$YYYYMMDD`); older dates go to a template-suffixed table
//! (`table_YYYYMMDD`) that an external merge process later folds in.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, NaiveDate, Utc};
use gcp_bigquery_client::{Client, model::table_data_insert_all_request::TableDataInsertAllRequest};
use gardener_core::{GardenerError, PipelineTokens, QuotaBackoff, Sink, SinkCounters, SinkLabel, split_in_half};
use tokio::sync::Mutex;

/// Rows dated within this many days of "now" write to the live partition
/// decorator rather than a template-suffixed table.
const RECENT_WINDOW_DAYS: i64 = 30;

struct State {
    counters: SinkCounters,
    closed: bool,
}

pub struct WarehouseSink {
    client: Arc<Client>,
    project_id: String,
    dataset_id: String,
    table_id: String,
    tokens: PipelineTokens,
    state: Mutex<State>,
}

impl WarehouseSink {
    /// `batch_service` forces the template-suffixed table even for
    /// recent-window dates, for deployments whose downstream merge
    /// pipeline expects every row to pass through it.
    pub fn new(
        client: Arc<Client>,
        project_id: String,
        dataset_id: String,
        table_base: &str,
        date: NaiveDate,
        batch_service: bool,
    ) -> Self {
        let table_id = partitioned_table_id(table_base, date, batch_service);
        Self {
            client,
            project_id,
            dataset_id,
            table_id,
            tokens: PipelineTokens::new(),
            state: Mutex::new(State {
                counters: SinkCounters::default(),
                closed: false,
            }),
        }
    }

    pub fn counters(&self) -> SinkCounters {
        self.state.try_lock().map(|s| s.counters).unwrap_or_default()
    }

    /// Boxed so it can recurse: `commit` is a trait method and async fns
    /// can't call themselves directly without indirection.
    fn commit_boxed<'a>(
        &'a self,
        rows: Vec<serde_json::Value>,
        label: &'a SinkLabel,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<u64, GardenerError>> + Send + 'a>> {
        Box::pin(self.commit_inner(rows, label))
    }

    async fn commit_inner(&self, rows: Vec<serde_json::Value>, label: &SinkLabel) -> Result<u64, GardenerError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let k = rows.len() as u64;

        fn build_request(rows: &[serde_json::Value]) -> Result<TableDataInsertAllRequest, GardenerError> {
            let mut request = TableDataInsertAllRequest::new();
            request.skip_invalid_rows(Some(true));
            for row in rows {
                request
                    .add_row(None, row.clone())
                    .map_err(|err| GardenerError::Fatal(format!("row encoding failed: {err}")))?;
            }
            Ok(request)
        }

        let _encode = self.tokens.acquire_encode().await;
        let mut pending_request = Some(build_request(&rows)?);
        drop(_encode);

        let mut backoff = QuotaBackoff::new();
        loop {
            let request = match pending_request.take() {
                Some(request) => request,
                None => build_request(&rows)?,
            };

            // Held only across the backend call itself: the payload-too-large
            // path below recurses into `commit_boxed`, which acquires this
            // same single-permit semaphore again, and the quota-retry path
            // sleeps between attempts. Either holding it across the
            // recursion or across the sleep would deadlock or starve other
            // commits for no reason.
            let result = {
                let _write = self.tokens.acquire_write().await;
                self.client
                    .tabledata()
                    .insert_all(&self.project_id, &self.dataset_id, &self.table_id, request)
                    .await
            };

            match result {
                Ok(response) => {
                    let insert_errors = response.insert_errors.unwrap_or_default();
                    let bad = insert_errors.len() as u64;
                    let succeeded = k - bad;
                    let mut state = self.state.lock().await;
                    if state.closed {
                        return Err(GardenerError::Fatal("commit after close".to_string()));
                    }
                    state.counters.accepted += k;
                    state.counters.committed += succeeded;
                    state.counters.bad += bad;
                    return Ok(succeeded);
                }
                Err(err) => {
                    let message = err.to_string();
                    if is_quota_exceeded(&message) {
                        if let Some(delay) = backoff.next_delay() {
                            tracing::warn!(reason = "quota_exceeded", table = %self.table_id, "retrying commit");
                            if let Some(m) = gardener_metrics::get_metrics() {
                                m.retry.with_label_values(&["quota_exceeded"]).inc();
                            }
                            tokio::time::sleep(delay).await;
                            continue;
                        }
                        let mut state = self.state.lock().await;
                        state.counters.failed += 1;
                        return Ok(0);
                    }
                    if is_payload_too_large(&message) {
                        if rows.len() < 2 {
                            return Err(GardenerError::Fatal(format!("payload too large for a single row: {message}")));
                        }
                        if let Some(m) = gardener_metrics::get_metrics() {
                            m.splitting_buffer.with_label_values(&[&label.0]).inc();
                        }
                        let (first, second) = split_in_half(rows);
                        let a = self.commit_boxed(first, label).await?;
                        let b = self.commit_boxed(second, label).await?;
                        return Ok(a + b);
                    }
                    let mut state = self.state.lock().await;
                    state.counters.accepted += k;
                    state.counters.bad += k;
                    tracing::warn!(error = %message, table = %self.table_id, "commit failed, rows counted as bad");
                    return Ok(0);
                }
            }
        }
    }
}

#[async_trait]
impl Sink for WarehouseSink {
    async fn commit(&self, rows: Vec<serde_json::Value>, label: &SinkLabel) -> Result<u64, GardenerError> {
        self.commit_inner(rows, label).await
    }

    async fn close(&self) -> Result<(), GardenerError> {
        let (_encode, _write) = self.tokens.acquire_both().await;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GardenerError::Fatal("close after close".to_string()));
        }
        state.closed = true;
        Ok(())
    }
}

fn partitioned_table_id(table_base: &str, date: NaiveDate, batch_service: bool) -> String {
    let today = Utc::now().date_naive();
    let recent = !batch_service && today - date < ChronoDuration::days(RECENT_WINDOW_DAYS);
    let stamp = date.format("%Y%m%d");
    if recent {
        format!("{table_base}${stamp}")
    } else {
        format!("{table_base}_{stamp}")
    }
}

fn is_quota_exceeded(message: &str) -> bool {
    message.contains("quotaExceeded") || message.contains("rateLimitExceeded")
}

fn is_payload_too_large(message: &str) -> bool {
    message.contains("Request payload size exceeds the limit") || message.contains("too large")
}

#[cfg(test)]
mod tests {
    use chrono::Duration as ChronoDuration;

    use super::*;

    #[test]
    fn recent_date_uses_partition_decorator() {
        let today = Utc::now().date_naive();
        let id = partitioned_table_id("ndt", today - ChronoDuration::days(5), false);
        assert!(id.contains('$'));
    }

    #[test]
    fn old_date_uses_template_suffix() {
        let today = Utc::now().date_naive();
        let id = partitioned_table_id("ndt", today - ChronoDuration::days(90), false);
        assert!(id.contains('_'));
        assert!(!id.contains('$'));
    }

    #[test]
    fn batch_service_forces_template_suffix_even_for_recent_dates() {
        let today = Utc::now().date_naive();
        let id = partitioned_table_id("ndt", today - ChronoDuration::days(5), true);
        assert!(id.contains('_'));
        assert!(!id.contains('$'));
    }

    #[test]
    fn classifies_quota_and_payload_errors_by_message() {
        assert!(is_quota_exceeded("quotaExceeded: too many requests"));
        assert!(is_payload_too_large("Request payload size exceeds the limit: 10485760 bytes"));
        assert!(!is_quota_exceeded("notFound: table missing"));
    }
}
