// SPDX-License-Identifier: Apache-2.0

//! `NdtParser`: a demonstration `Parser`. Parsing any specific on-the-wire
//! measurement format is explicitly out of scope, so this extracts only a
//! trivial per-entry schema (name, byte length, sha256 digest) rather than
//! any real NDT record — enough to exercise the `TaskRunner` → `RowBatch`
//! → `Sink` path end to end.
//!
//! Sink sessions are opened lazily, keyed by `sink_scope`: one session per
//! archive (the default) or one shared session for the whole job. The
//! `ParserFactory` is invoked once per job, so this is the only place able
//! to tell the two scopes apart.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use gardener_core::{ArchiveDescriptor, GardenerError, RowBatch, Sink, SinkLabel};
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;

use crate::config::SinkScope;

/// Soft batch capacity before a row push triggers an eager drain. Chosen
/// to keep a single archive's buffered rows well under the commit
/// pipeline's per-payload size ceiling.
const BATCH_SOFT_CAPACITY: usize = 5_000;

/// Builds the `Sink` for one session key (an archive key under `Archive`
/// scope, or the empty string under `Job` scope).
pub type SinkFactory = Arc<dyn Fn(&str) -> Result<Arc<dyn Sink>, GardenerError> + Send + Sync>;

struct Session {
    sink: Arc<dyn Sink>,
    label: SinkLabel,
    batch: RowBatch,
}

pub struct NdtParser {
    sink_factory: SinkFactory,
    label_prefix: String,
    omit_deltas: bool,
    scope: SinkScope,
    sessions: Mutex<HashMap<String, Session>>,
}

impl NdtParser {
    pub fn new(sink_factory: SinkFactory, label_prefix: String, omit_deltas: bool, scope: SinkScope) -> Self {
        Self {
            sink_factory,
            label_prefix,
            omit_deltas,
            scope,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    fn session_key(&self, archive: &ArchiveDescriptor) -> String {
        match self.scope {
            SinkScope::Archive => archive.key.clone(),
            SinkScope::Job => String::new(),
        }
    }
}

#[async_trait]
impl gardener_core::Parser for NdtParser {
    async fn parse_and_insert(
        &self,
        archive: &ArchiveDescriptor,
        name: &str,
        content: bytes::Bytes,
    ) -> Result<(), GardenerError> {
        let digest = Sha256::digest(&content);
        let mut row = serde_json::json!({
            "archive": archive.key,
            "filename": name,
            "bytes": content.len(),
            "sha256": format!("{digest:x}"),
        });
        if self.omit_deltas {
            row.as_object_mut()
                .expect("row is always constructed as a JSON object")
                .remove("deltas");
        }

        let key = self.session_key(archive);
        let drained = {
            let mut sessions = self.sessions.lock().await;
            let session = match sessions.entry(key.clone()) {
                std::collections::hash_map::Entry::Occupied(e) => e.into_mut(),
                std::collections::hash_map::Entry::Vacant(e) => {
                    let sink = (self.sink_factory)(&key)?;
                    let label = SinkLabel(format!("{}-{}", self.label_prefix, key));
                    e.insert(Session { sink, label, batch: RowBatch::new(BATCH_SOFT_CAPACITY) })
                }
            };
            session.batch.push(row);
            if session.batch.is_full() {
                Some((session.sink.clone(), session.label.clone(), session.batch.drain()))
            } else {
                None
            }
        };

        if let Some((sink, label, rows)) = drained {
            if !rows.is_empty() {
                sink.commit(rows, &label).await?;
            }
        }
        Ok(())
    }

    /// Under `Archive` scope this is the session's only chance to drain and
    /// close — the key never comes back once this archive's `TaskRunner`
    /// returns. Under `Job` scope the shared session stays open; draining
    /// here only empties its buffer, and `close` finalizes it later.
    async fn flush(&self, archive: &ArchiveDescriptor) -> Result<(), GardenerError> {
        let key = self.session_key(archive);
        match self.scope {
            SinkScope::Archive => {
                let session = self.sessions.lock().await.remove(&key);
                let Some(mut session) = session else { return Ok(()) };
                let rows = session.batch.drain();
                if !rows.is_empty() {
                    session.sink.commit(rows, &session.label).await?;
                }
                session.sink.close().await
            }
            SinkScope::Job => {
                let drained = {
                    let mut sessions = self.sessions.lock().await;
                    sessions.get_mut(&key).map(|s| (s.sink.clone(), s.label.clone(), s.batch.drain()))
                };
                let Some((sink, label, rows)) = drained else { return Ok(()) };
                if !rows.is_empty() {
                    sink.commit(rows, &label).await?;
                }
                Ok(())
            }
        }
    }

    /// Closes whatever sessions are still open: the single shared session
    /// under `Job` scope, or, under `Archive` scope, any stragglers whose
    /// `flush` never ran (e.g. a `TaskRunner` that returned early without
    /// reaching its own flush call).
    async fn close(&self) -> Result<(), GardenerError> {
        let remaining: Vec<Session> = self.sessions.lock().await.drain().map(|(_, s)| s).collect();
        let mut first_err = None;
        for session in remaining {
            if let Err(err) = session.sink.close().await {
                if first_err.is_none() {
                    first_err = Some(err);
                }
            }
        }
        match first_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn table_name(&self) -> &str {
        "ndt"
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;
    use gardener_core::Parser as _;
    use tokio::sync::Mutex as TokioMutex;

    use super::*;

    struct RecordingSink {
        committed: TokioMutex<Vec<serde_json::Value>>,
        closed: std::sync::atomic::AtomicUsize,
    }

    impl RecordingSink {
        fn new() -> Self {
            Self { committed: TokioMutex::new(Vec::new()), closed: std::sync::atomic::AtomicUsize::new(0) }
        }
    }

    #[async_trait]
    impl Sink for RecordingSink {
        async fn commit(&self, rows: Vec<serde_json::Value>, _label: &SinkLabel) -> Result<u64, GardenerError> {
            let n = rows.len() as u64;
            self.committed.lock().await.extend(rows);
            Ok(n)
        }

        async fn close(&self) -> Result<(), GardenerError> {
            self.closed.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(())
        }
    }

    fn descriptor(key: &str) -> ArchiveDescriptor {
        ArchiveDescriptor {
            bucket: "b".to_string(),
            key: key.to_string(),
            size: 0,
            last_modified: Utc::now(),
        }
    }

    // A plain `std::sync::Mutex` here, not a tokio one: the factory closure
    // itself is synchronous, and locking a tokio `Mutex` from sync code
    // inside an async context would panic.
    fn factory(sinks: Arc<std::sync::Mutex<HashMap<String, Arc<RecordingSink>>>>) -> SinkFactory {
        Arc::new(move |key: &str| {
            let mut guard = sinks.lock().unwrap();
            let sink = guard.entry(key.to_string()).or_insert_with(|| Arc::new(RecordingSink::new())).clone();
            Ok(sink as Arc<dyn Sink>)
        })
    }

    #[tokio::test]
    async fn archive_scope_opens_and_closes_a_session_per_archive() {
        let sinks: Arc<std::sync::Mutex<HashMap<String, Arc<RecordingSink>>>> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let parser = NdtParser::new(factory(sinks.clone()), "ndt".to_string(), false, SinkScope::Archive);

        let a = descriptor("ndt/ndt/2024/01/02/a.tgz");
        let b = descriptor("ndt/ndt/2024/01/02/b.tgz");

        parser.parse_and_insert(&a, "x.json", bytes::Bytes::from_static(b"1")).await.unwrap();
        parser.parse_and_insert(&b, "y.json", bytes::Bytes::from_static(b"22")).await.unwrap();
        parser.flush(&a).await.unwrap();
        parser.flush(&b).await.unwrap();

        let guard = sinks.lock().unwrap();
        assert_eq!(guard.len(), 2);
        assert_eq!(guard[&a.key].committed.lock().await.len(), 1);
        assert_eq!(guard[&a.key].closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        assert_eq!(guard[&b.key].closed.load(std::sync::atomic::Ordering::SeqCst), 1);
        drop(guard);

        // close() after both archives already flushed finds nothing left to do.
        parser.close().await.unwrap();
    }

    #[tokio::test]
    async fn job_scope_shares_one_session_across_archives_until_close() {
        let sinks: Arc<std::sync::Mutex<HashMap<String, Arc<RecordingSink>>>> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let parser = NdtParser::new(factory(sinks.clone()), "ndt".to_string(), false, SinkScope::Job);

        let a = descriptor("ndt/ndt/2024/01/02/a.tgz");
        let b = descriptor("ndt/ndt/2024/01/02/b.tgz");

        parser.parse_and_insert(&a, "x.json", bytes::Bytes::from_static(b"1")).await.unwrap();
        parser.flush(&a).await.unwrap();
        parser.parse_and_insert(&b, "y.json", bytes::Bytes::from_static(b"22")).await.unwrap();
        parser.flush(&b).await.unwrap();

        {
            let guard = sinks.lock().unwrap();
            assert_eq!(guard.len(), 1);
            let shared = guard.values().next().unwrap();
            assert_eq!(shared.committed.lock().await.len(), 2);
            assert_eq!(shared.closed.load(std::sync::atomic::Ordering::SeqCst), 0);
        }

        parser.close().await.unwrap();
        let guard = sinks.lock().unwrap();
        let shared = guard.values().next().unwrap();
        assert_eq!(shared.closed.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn omit_deltas_strips_the_deltas_field() {
        let sinks: Arc<std::sync::Mutex<HashMap<String, Arc<RecordingSink>>>> = Arc::new(std::sync::Mutex::new(HashMap::new()));
        let parser = NdtParser::new(factory(sinks.clone()), "ndt".to_string(), true, SinkScope::Job);
        let a = descriptor("ndt/ndt/2024/01/02/a.tgz");
        parser.parse_and_insert(&a, "a.json", bytes::Bytes::from_static(b"hello")).await.unwrap();
        parser.flush(&a).await.unwrap();

        let guard = sinks.lock().unwrap();
        let shared = guard.values().next().unwrap();
        let committed = shared.committed.lock().await;
        assert!(committed[0].get("deltas").is_none());
    }
}
