// SPDX-License-Identifier: Apache-2.0

//! Object-store `Sink`: one line-delimited JSON object per archive, only
//! visible after a successful `close`. Metadata (`rows`, `writeError`) is
//! recorded in a sibling `{key}.meta.json` object rather than via
//! backend-specific object metadata, since that attribute surface differs
//! across the object stores this crate's `ObjectStore` trait abstracts
//! over.

use std::sync::Arc;

use async_trait::async_trait;
use gardener_core::{GardenerError, PipelineTokens, Sink, SinkCounters, SinkLabel};
use object_store::{ObjectStore, path::Path as StorePath};
use serde_json::json;
use tokio::sync::Mutex;

struct State {
    scratch: Vec<u8>,
    counters: SinkCounters,
    write_error: Option<String>,
    closed: bool,
}

pub struct ObjectStoreSink {
    store: Arc<dyn ObjectStore>,
    key: String,
    tokens: PipelineTokens,
    state: Mutex<State>,
}

impl ObjectStoreSink {
    /// `archive_key` is the archive's object-store key (without `.jsonl`);
    /// the sink writes to `{archive_key}.jsonl`.
    pub fn new(store: Arc<dyn ObjectStore>, archive_key: &str) -> Self {
        Self {
            store,
            key: format!("{archive_key}.jsonl"),
            tokens: PipelineTokens::new(),
            state: Mutex::new(State {
                scratch: Vec::new(),
                counters: SinkCounters::default(),
                write_error: None,
                closed: false,
            }),
        }
    }

    pub fn counters(&self) -> SinkCounters {
        // Only ever called after `close` in this crate's own tests; a
        // blocking_lock here would deadlock a real caller, so this takes
        // the async path via `try_lock`, falling back to the last known
        // value under contention.
        self.state
            .try_lock()
            .map(|s| s.counters)
            .unwrap_or_default()
    }
}

#[async_trait]
impl Sink for ObjectStoreSink {
    async fn commit(&self, rows: Vec<serde_json::Value>, _label: &SinkLabel) -> Result<u64, GardenerError> {
        if rows.is_empty() {
            return Ok(0);
        }
        let k = rows.len() as u64;

        let _encode = self.tokens.acquire_encode().await;
        let mut encoded = Vec::with_capacity(rows.len());
        let mut encode_failures: u64 = 0;
        for row in &rows {
            match serde_json::to_vec(row) {
                Ok(mut line) => {
                    line.push(b'\n');
                    encoded.push(line);
                }
                Err(_) => encode_failures += 1,
            }
        }
        drop(_encode);

        let _write = self.tokens.acquire_write().await;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GardenerError::Fatal("commit after close".to_string()));
        }

        let succeeded = encoded.len() as u64;
        for line in encoded {
            state.scratch.extend_from_slice(&line);
        }

        state.counters.accepted += k;
        state.counters.committed += succeeded;
        state.counters.bad += encode_failures;

        Ok(succeeded)
    }

    async fn close(&self) -> Result<(), GardenerError> {
        let (_encode, _write) = self.tokens.acquire_both().await;
        let mut state = self.state.lock().await;
        if state.closed {
            return Err(GardenerError::Fatal("close after close".to_string()));
        }
        state.closed = true;

        let body = std::mem::take(&mut state.scratch);
        let rows = state.counters.committed;
        let write_error = state.write_error.clone();
        drop(state);

        if let Err(err) = self.store.put(&StorePath::from(self.key.as_str()), body.into()).await {
            return Err(GardenerError::Transient(err.to_string()));
        }

        let meta = json!({ "rows": rows, "writeError": write_error });
        let meta_key = format!("{}.meta.json", self.key);
        let meta_bytes = serde_json::to_vec(&meta).map_err(GardenerError::from)?;
        self.store
            .put(&StorePath::from(meta_key.as_str()), meta_bytes.into())
            .await
            .map_err(|err| GardenerError::Transient(err.to_string()))?;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use object_store::memory::InMemory;
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn commits_then_close_writes_jsonl_and_metadata() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store.clone(), "ndt/2024/archive.tgz");
        let label = SinkLabel("ndt".to_string());

        let committed = sink
            .commit(vec![json!({"a": 1}), json!({"b": 2})], &label)
            .await
            .unwrap();
        assert_eq!(committed, 2);

        sink.close().await.unwrap();

        let body = store
            .get(&StorePath::from("ndt/2024/archive.tgz.jsonl"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let text = String::from_utf8(body.to_vec()).unwrap();
        assert_eq!(text.lines().count(), 2);

        let meta = store
            .get(&StorePath::from("ndt/2024/archive.tgz.jsonl.meta.json"))
            .await
            .unwrap()
            .bytes()
            .await
            .unwrap();
        let meta: serde_json::Value = serde_json::from_slice(&meta).unwrap();
        assert_eq!(meta["rows"], 2);
    }

    #[tokio::test]
    async fn commit_after_close_fails() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store, "ndt/archive.tgz");
        let label = SinkLabel("ndt".to_string());
        sink.close().await.unwrap();
        let err = sink.commit(vec![json!({"a": 1})], &label).await.unwrap_err();
        assert!(matches!(err, GardenerError::Fatal(_)));
    }

    #[tokio::test]
    async fn zero_row_commit_is_a_noop() {
        let store = Arc::new(InMemory::new());
        let sink = ObjectStoreSink::new(store, "ndt/archive.tgz");
        let label = SinkLabel("ndt".to_string());
        assert_eq!(sink.commit(vec![], &label).await.unwrap(), 0);
    }
}
