// SPDX-License-Identifier: Apache-2.0

//! C5: TaskRunner — drives one archive end-to-end: iterate entries, invoke
//! the parser, flush the sink, emit metrics.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Datelike;
use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::{
    archive_key::ArchiveKey,
    archive_reader::{ArchiveReader, ReaderOptions},
    errors::GardenerError,
    model::ArchiveDescriptor,
};

/// Per-datatype record parser, an external collaborator picked by the
/// factory that constructs a `TaskRunner` — never switched on at hot-path
/// call sites. Wired to its `Sink` and `Annotator` at construction time so
/// the sink never needs a reverse reference back to the parser.
#[async_trait]
pub trait Parser: Send + Sync {
    async fn parse_and_insert(
        &self,
        archive: &ArchiveDescriptor,
        name: &str,
        content: bytes::Bytes,
    ) -> Result<(), GardenerError>;

    /// Drains any buffered rows to the sink. Called once per archive, at
    /// the end of that archive's iteration, regardless of how iteration
    /// terminated. Takes the archive back so a parser running per-archive
    /// `Sink` sessions can tell which session to drain (and, under that
    /// scope, close).
    async fn flush(&self, archive: &ArchiveDescriptor) -> Result<(), GardenerError>;

    /// Closes the underlying `Sink` session. Called exactly once per job,
    /// after every `TaskRunner` sharing this parser has returned — never
    /// per archive, since the session outlives any single archive.
    async fn close(&self) -> Result<(), GardenerError>;

    fn table_name(&self) -> &str;
}

/// Enriches a parsed row with fields not present in the archive itself
/// (e.g. site metadata looked up out of band). Picked alongside the parser
/// at factory-construction time.
pub trait Annotator: Send + Sync {
    fn annotate(&self, row: &mut serde_json::Value);
}

pub struct TaskRunner {
    descriptor: ArchiveDescriptor,
    store: Arc<dyn ObjectStore>,
    reader_opts: ReaderOptions,
    parser: Arc<dyn Parser>,
}

impl TaskRunner {
    pub fn new(
        descriptor: ArchiveDescriptor,
        store: Arc<dyn ObjectStore>,
        reader_opts: ReaderOptions,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            descriptor,
            store,
            reader_opts,
            parser,
        }
    }

    pub fn info(&self) -> String {
        format!("{}/{}", self.descriptor.bucket, self.descriptor.key)
    }

    /// 1. Validates the archive's key yields a recognized data-type,
    /// failing fast with `InvalidInput` otherwise. 2. Iterates entries
    /// through the parser. 3. Flushes the parser/sink and returns the last
    /// terminal error, or `Ok(())` if the terminator was orderly end of
    /// archive.
    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), GardenerError> {
        let key = match ArchiveKey::parse(&self.descriptor.key) {
            Ok(key) => key,
            Err(err) => {
                self.emit_outcome_metrics("unknown", "Error", None);
                return Err(err);
            }
        };

        let mut reader = ArchiveReader::open(
            self.store.clone(),
            self.descriptor.clone(),
            self.reader_opts,
        );

        let outcome = self.drive(&mut reader, &key, cancel).await;
        reader.close().await;

        let flush_result = self.parser.flush(&self.descriptor).await;
        let outcome = match (outcome, flush_result) {
            (Ok(()), Err(flush_err)) => Err(flush_err),
            (outcome, _) => outcome,
        };

        let outcome_label = match &outcome {
            Ok(()) => "OK",
            Err(GardenerError::Canceled) => "Canceled",
            Err(_) => "Error",
        };
        self.emit_outcome_metrics(&key.datatype, outcome_label, outcome.is_ok().then_some(&key));
        outcome
    }

    async fn drive(
        &self,
        reader: &mut ArchiveReader,
        key: &ArchiveKey,
        cancel: &CancellationToken,
    ) -> Result<(), GardenerError> {
        loop {
            let next = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(GardenerError::Canceled),
                next = reader.next_test() => next,
            };

            let entry = match next {
                Ok(None) => return Ok(()),
                Ok(Some(entry)) => entry,
                Err(err) => return Err(err),
            };

            if entry.oversize {
                if let Some(m) = gardener_metrics::get_metrics() {
                    m.skipped_oversize.with_label_values(&[&key.datatype]).inc();
                }
                continue;
            }

            if entry.non_regular {
                if let Some(m) = gardener_metrics::get_metrics() {
                    m.skipped_non_regular.with_label_values(&[&key.datatype]).inc();
                }
                continue;
            }

            match self
                .parser
                .parse_and_insert(&self.descriptor, &entry.name, entry.content)
                .await
            {
                Ok(()) => {}
                // A signaled fail-fast condition (corrupt archive framing)
                // terminates iteration; anything else is a per-row error,
                // already counted by the parser/sink and swallowed here.
                Err(err @ GardenerError::Fatal(_)) => return Err(err),
                Err(_) => {}
            }
        }
    }

    fn emit_outcome_metrics(&self, datatype: &str, outcome_label: &str, succeeded: Option<&ArchiveKey>) {
        let Some(m) = gardener_metrics::get_metrics() else {
            return;
        };
        m.tasks_outcome
            .with_label_values(&[datatype, outcome_label])
            .inc();

        if let Some(key) = succeeded {
            let weekday = self.descriptor.last_modified.weekday().to_string();
            m.files_processed
                .with_label_values(&[&key.experiment, &key.site, &key.host, &weekday])
                .inc();
        }
    }
}
