// SPDX-License-Identifier: Apache-2.0

//! C2: ArchiveListing — a producer of archive descriptors under a prefix,
//! filtered by regex.
//!
//! The lister pre-fetches the full match set into memory in one pass (the
//! object store is asked to list everything under `prefix` up front), then
//! streams descriptors out one at a time via `next`. If the initial list
//! fails, every subsequent `next` call returns the same error.

use std::{collections::VecDeque, sync::Arc};

use futures::TryStreamExt;
use object_store::{ObjectStore, path::Path as StorePath};
use regex::Regex;
use tokio_util::sync::CancellationToken;

use crate::{errors::GardenerError, model::ArchiveDescriptor};

pub struct ArchiveListing {
    bucket: String,
    descriptors: VecDeque<ArchiveDescriptor>,
    list_error: Option<String>,
}

impl ArchiveListing {
    /// Lists everything under `prefix` once, filtering out keys that fail
    /// `key_filter` and any entry without a terminal key (directory
    /// prefixes). Listing order is whatever the store presents; no sorting
    /// is applied.
    pub async fn new(
        store: &dyn ObjectStore,
        bucket: String,
        prefix: &str,
        key_filter: &Regex,
    ) -> Self {
        let store_prefix = StorePath::from(prefix);
        let mut descriptors = VecDeque::new();
        let mut list_error = None;

        let mut stream = store.list(Some(&store_prefix));
        loop {
            match stream.try_next().await {
                Ok(Some(meta)) => {
                    let key = meta.location.to_string();
                    if key.ends_with('/') || key.is_empty() {
                        continue;
                    }
                    if !key_filter.is_match(&key) {
                        continue;
                    }
                    descriptors.push_back(ArchiveDescriptor {
                        bucket: bucket.clone(),
                        key,
                        size: meta.size as u64,
                        last_modified: meta.last_modified,
                    });
                }
                Ok(None) => break,
                Err(err) => {
                    list_error = Some(err.to_string());
                    descriptors.clear();
                    break;
                }
            }
        }

        Self {
            bucket,
            descriptors,
            list_error,
        }
    }

    /// Returns the next descriptor, `Ok(None)` on orderly exhaustion, or the
    /// stored listing error forever after the initial list failed.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<ArchiveDescriptor>, GardenerError> {
        if cancel.is_cancelled() {
            return Err(GardenerError::Canceled);
        }
        if let Some(err) = &self.list_error {
            return Err(GardenerError::Transient(err.clone()));
        }
        Ok(self.descriptors.pop_front())
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use object_store::{ObjectStore, memory::InMemory, path::Path as StorePath};

    use super::*;

    async fn seeded_store(keys: &[&str]) -> InMemory {
        let store = InMemory::new();
        for key in keys {
            store
                .put(&StorePath::from(*key), bytes::Bytes::from_static(b"x").into())
                .await
                .unwrap();
        }
        store
    }

    #[tokio::test]
    async fn filters_by_regex_and_skips_directories() {
        let store = seeded_store(&[
            "ndt/2024/01/01/a.tgz",
            "ndt/2024/01/01/b.txt",
            "ndt/2024/01/01/",
        ])
        .await;
        let filter = Regex::new(r"\.tgz$").unwrap();
        let mut listing =
            ArchiveListing::new(&store, "bucket".into(), "ndt/2024/01/01", &filter).await;

        let cancel = CancellationToken::new();
        let first = listing.next(&cancel).await.unwrap().unwrap();
        assert_eq!(first.key, "ndt/2024/01/01/a.tgz");
        assert!(listing.next(&cancel).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn cancellation_fails_next() {
        let store = seeded_store(&["ndt/a.tgz"]).await;
        let filter = Regex::new(r"\.tgz$").unwrap();
        let mut listing = ArchiveListing::new(&store, "bucket".into(), "ndt", &filter).await;
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(matches!(
            listing.next(&cancel).await,
            Err(GardenerError::Canceled)
        ));
    }
}
