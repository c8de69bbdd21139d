// SPDX-License-Identifier: Apache-2.0

//! C3: ArchiveReader — streams test-file entries out of a (possibly
//! gzip-wrapped) tar archive, with bounded memory, retries, and a
//! per-entry size limit.
//!
//! The source-style "producer task streaming into a channel, consumer
//! iterating via Next" shape is implemented literally: a background task
//! (on the blocking pool, since `tar`/`flate2` are synchronous readers)
//! drives the tar framing and pushes one entry at a time into a
//! single-slot channel. `next_test` selects between that channel and
//! orderly/terminal states, which is what keeps archive memory use to one
//! entry at a time rather than the whole object.

use std::{io::Read, pin::Pin, sync::Arc, time::Duration};

use bytes::Buf;
use futures::{Stream, StreamExt};
use object_store::{ObjectStore, path::Path as StorePath};
use tokio::{sync::mpsc, task::JoinHandle};

use crate::{errors::GardenerError, model::ArchiveDescriptor, model::TestEntry};

#[derive(Debug, Clone, Copy)]
pub struct ReaderOptions {
    /// Entries larger than this are dropped (content replaced with an empty
    /// buffer) but iteration continues. Default 200 MB.
    pub max_bytes: u64,
    /// Initial backoff delay, doubled per retry. Default 16 ms.
    pub base_delay: Duration,
    /// Number of retries allowed per failure point (header/body read)
    /// before the 11th cumulative failure classifies as `Transient`.
    pub max_attempts: u32,
}

impl Default for ReaderOptions {
    fn default() -> Self {
        Self {
            max_bytes: 200 * 1024 * 1024,
            base_delay: Duration::from_millis(16),
            max_attempts: 10,
        }
    }
}

enum ReaderMsg {
    Entry(TestEntry),
    EndOfArchive,
    Transient(String),
}

pub struct ArchiveReader {
    rx: mpsc::Receiver<ReaderMsg>,
    producer: Option<JoinHandle<()>>,
}

impl ArchiveReader {
    pub fn open(
        store: Arc<dyn ObjectStore>,
        descriptor: ArchiveDescriptor,
        opts: ReaderOptions,
    ) -> Self {
        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::runtime::Handle::current();
        let key = descriptor.key;
        let producer = tokio::task::spawn_blocking(move || {
            run_producer(handle, store, key, opts, tx);
        });
        Self {
            rx,
            producer: Some(producer),
        }
    }

    /// Returns the next entry, `Ok(None)` on orderly end of archive, or
    /// `Transient` once the retry budget at either failure point is
    /// exhausted. Non-regular entries (directories, symlinks, ...) and
    /// oversize entries are surfaced with empty `content` and `non_regular`
    /// / `oversize` respectively set; the caller must skip both rather than
    /// parse them.
    pub async fn next_test(&mut self) -> Result<Option<TestEntry>, GardenerError> {
        match self.rx.recv().await {
            Some(ReaderMsg::Entry(entry)) => Ok(Some(entry)),
            Some(ReaderMsg::EndOfArchive) | None => Ok(None),
            Some(ReaderMsg::Transient(msg)) => Err(GardenerError::Transient(msg)),
        }
    }

    /// Releases the underlying stream. Safe to call after a partial
    /// failure; idempotent in that a second call is a no-op.
    pub async fn close(&mut self) {
        self.rx.close();
        if let Some(producer) = self.producer.take() {
            let _ = producer.await;
        }
    }
}

/// Bridges an `object_store` byte stream into a synchronous `std::io::Read`
/// for `tar`/`flate2`, pulling one chunk at a time via `Handle::block_on`
/// rather than buffering the whole object up front. This is what keeps
/// archive memory use to roughly one entry in flight instead of the whole
/// object.
struct StreamReader {
    handle: tokio::runtime::Handle,
    stream: Pin<Box<dyn Stream<Item = object_store::Result<bytes::Bytes>> + Send>>,
    current: bytes::Bytes,
}

impl Read for StreamReader {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if !self.current.is_empty() {
                let n = buf.len().min(self.current.len());
                buf[..n].copy_from_slice(&self.current[..n]);
                self.current.advance(n);
                return Ok(n);
            }
            match self.handle.block_on(self.stream.next()) {
                Some(Ok(chunk)) => {
                    self.current = chunk;
                }
                Some(Err(err)) => {
                    return Err(std::io::Error::other(err.to_string()));
                }
                None => return Ok(0),
            }
        }
    }
}

fn is_gzip_key(key: &str) -> bool {
    let lower = key.to_ascii_lowercase();
    lower.ends_with(".gz") || lower.ends_with(".tgz") || lower.ends_with(".tar.gz")
}

fn backoff_delay(base: Duration, attempt: u32) -> Duration {
    base.saturating_mul(1u32 << attempt.saturating_sub(1).min(20))
}

fn run_producer(
    handle: tokio::runtime::Handle,
    store: Arc<dyn ObjectStore>,
    key: String,
    opts: ReaderOptions,
    tx: mpsc::Sender<ReaderMsg>,
) {
    let gzip = is_gzip_key(&key);
    let mut attempt: u32 = 0;
    let mut entries_yielded: u64 = 0;

    loop {
        let path = StorePath::from(key.as_str());
        let opened = handle.block_on(async { store.get(&path).await });

        let get_result = match opened {
            Ok(r) => r,
            Err(err) => {
                attempt += 1;
                if attempt > opts.max_attempts {
                    let _ = tx.blocking_send(ReaderMsg::Transient(err.to_string()));
                    return;
                }
                tracing::debug!(key = %key, attempt, "retrying archive header read");
                if let Some(m) = gardener_metrics::get_metrics() {
                    m.retry.with_label_values(&["read_error"]).inc();
                }
                std::thread::sleep(backoff_delay(opts.base_delay, attempt));
                continue;
            }
        };

        let stream_reader = StreamReader {
            handle: handle.clone(),
            stream: get_result.into_stream(),
            current: bytes::Bytes::new(),
        };
        let reader: Box<dyn Read> = if gzip {
            Box::new(flate2::read::GzDecoder::new(stream_reader))
        } else {
            Box::new(stream_reader)
        };
        let mut archive = tar::Archive::new(reader);
        let iter = match archive.entries() {
            Ok(it) => it,
            Err(err) => {
                let _ = tx.blocking_send(ReaderMsg::Transient(err.to_string()));
                return;
            }
        };

        let mut skip = entries_yielded;
        let mut stream_failed = false;

        for entry in iter {
            if skip > 0 {
                skip -= 1;
                continue;
            }
            match entry {
                Ok(mut e) => {
                    let name = e
                        .path()
                        .map(|p| p.to_string_lossy().into_owned())
                        .unwrap_or_default();
                    let is_regular = e.header().entry_type().is_file();
                    let size = e.header().size().unwrap_or(0);

                    let test_entry = if !is_regular {
                        TestEntry {
                            name,
                            content: bytes::Bytes::new(),
                            oversize: false,
                            non_regular: true,
                        }
                    } else if size > opts.max_bytes {
                        let _ = std::io::copy(&mut e, &mut std::io::sink());
                        if let Some(m) = gardener_metrics::get_metrics() {
                            m.skipped_oversize.with_label_values(&["unknown"]).inc();
                        }
                        TestEntry {
                            name,
                            content: bytes::Bytes::new(),
                            oversize: true,
                            non_regular: false,
                        }
                    } else {
                        let mut buf = Vec::with_capacity(size as usize);
                        if let Err(err) = e.read_to_end(&mut buf) {
                            attempt += 1;
                            let reason = if err.kind() == std::io::ErrorKind::UnexpectedEof
                                || err.to_string().contains("unexpected EOF")
                            {
                                "unexpected_eof"
                            } else {
                                "read_error"
                            };
                            if let Some(m) = gardener_metrics::get_metrics() {
                                m.retry.with_label_values(&[reason]).inc();
                            }
                            if attempt > opts.max_attempts {
                                let _ = tx.blocking_send(ReaderMsg::Transient(err.to_string()));
                                return;
                            }
                            tracing::debug!(key = %key, attempt, reason, "retrying archive body read");
                            stream_failed = true;
                            break;
                        }
                        TestEntry {
                            name,
                            content: bytes::Bytes::from(buf),
                            oversize: false,
                            non_regular: false,
                        }
                    };

                    entries_yielded += 1;
                    if tx.blocking_send(ReaderMsg::Entry(test_entry)).is_err() {
                        return;
                    }
                }
                Err(err) => {
                    attempt += 1;
                    if attempt > opts.max_attempts {
                        let _ = tx.blocking_send(ReaderMsg::Transient(err.to_string()));
                        return;
                    }
                    stream_failed = true;
                    break;
                }
            }
        }

        if stream_failed {
            std::thread::sleep(backoff_delay(opts.base_delay, attempt));
            continue;
        }

        let _ = tx.blocking_send(ReaderMsg::EndOfArchive);
        return;
    }
}

#[cfg(test)]
mod tests {
    use object_store::{ObjectStore, memory::InMemory, path::Path as StorePath};

    use super::*;

    fn build_tar(entries: &[(&str, &[u8])]) -> Vec<u8> {
        let mut builder = tar::Builder::new(Vec::new());
        for (name, content) in entries {
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(0o644);
            header.set_entry_type(tar::EntryType::Regular);
            header.set_cksum();
            builder.append_data(&mut header, name, *content).unwrap();
        }
        builder.into_inner().unwrap()
    }

    #[tokio::test]
    async fn reads_regular_entries_in_order() {
        let store = Arc::new(InMemory::new());
        let tar_bytes = build_tar(&[("a", b"one"), ("b", b"two")]);
        store
            .put(&StorePath::from("archive.tar"), tar_bytes.into())
            .await
            .unwrap();

        let descriptor = ArchiveDescriptor {
            bucket: "bucket".into(),
            key: "archive.tar".into(),
            size: 0,
            last_modified: chrono::Utc::now(),
        };
        let mut reader = ArchiveReader::open(store, descriptor, ReaderOptions::default());

        let first = reader.next_test().await.unwrap().unwrap();
        assert_eq!(first.name, "a");
        assert_eq!(&first.content[..], b"one");

        let second = reader.next_test().await.unwrap().unwrap();
        assert_eq!(second.name, "b");

        assert!(reader.next_test().await.unwrap().is_none());
        reader.close().await;
    }

    #[tokio::test]
    async fn surfaces_directory_entries_as_non_regular() {
        let store = Arc::new(InMemory::new());
        let mut builder = tar::Builder::new(Vec::new());
        let mut dir_header = tar::Header::new_gnu();
        dir_header.set_size(0);
        dir_header.set_mode(0o755);
        dir_header.set_entry_type(tar::EntryType::Directory);
        dir_header.set_cksum();
        builder.append_data(&mut dir_header, "a_dir/", &b""[..]).unwrap();
        let mut file_header = tar::Header::new_gnu();
        file_header.set_size(3);
        file_header.set_mode(0o644);
        file_header.set_entry_type(tar::EntryType::Regular);
        file_header.set_cksum();
        builder.append_data(&mut file_header, "a_dir/f", &b"one"[..]).unwrap();
        let tar_bytes = builder.into_inner().unwrap();
        store
            .put(&StorePath::from("archive.tar"), tar_bytes.into())
            .await
            .unwrap();

        let descriptor = ArchiveDescriptor {
            bucket: "bucket".into(),
            key: "archive.tar".into(),
            size: 0,
            last_modified: chrono::Utc::now(),
        };
        let mut reader = ArchiveReader::open(store, descriptor, ReaderOptions::default());

        let dir_entry = reader.next_test().await.unwrap().unwrap();
        assert!(dir_entry.non_regular);
        assert!(dir_entry.content.is_empty());

        let file_entry = reader.next_test().await.unwrap().unwrap();
        assert!(!file_entry.non_regular);
        assert_eq!(&file_entry.content[..], b"one");

        assert!(reader.next_test().await.unwrap().is_none());
        reader.close().await;
    }

    #[tokio::test]
    async fn drops_oversize_entry_but_continues() {
        let store = Arc::new(InMemory::new());
        let big = vec![0u8; 1024];
        let tar_bytes = build_tar(&[("a", b"small"), ("big", &big), ("c", b"small2")]);
        store
            .put(&StorePath::from("archive.tar"), tar_bytes.into())
            .await
            .unwrap();

        let descriptor = ArchiveDescriptor {
            bucket: "bucket".into(),
            key: "archive.tar".into(),
            size: 0,
            last_modified: chrono::Utc::now(),
        };
        let opts = ReaderOptions {
            max_bytes: 100,
            ..Default::default()
        };
        let mut reader = ArchiveReader::open(store, descriptor, opts);

        let a = reader.next_test().await.unwrap().unwrap();
        assert!(!a.oversize);
        let big_entry = reader.next_test().await.unwrap().unwrap();
        assert!(big_entry.oversize);
        assert!(big_entry.content.is_empty());
        let c = reader.next_test().await.unwrap().unwrap();
        assert!(!c.oversize);
        assert_eq!(c.name, "c");
    }
}
