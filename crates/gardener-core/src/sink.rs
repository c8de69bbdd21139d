// SPDX-License-Identifier: Apache-2.0

//! C4: Sink — the capability trait a row writer implements, plus the
//! backoff/splitting helpers both concrete sinks (object-store, warehouse)
//! share.
//!
//! Concrete implementations (`ObjectStoreSink`, `WarehouseSink`) live in
//! `gardener-sinks`; this crate only owns the boundary and the pieces of
//! the commit algorithm that are backend-agnostic.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use rand::Rng;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

use crate::{errors::GardenerError, model::SinkLabel};

/// Abstracts "commit these rows, tolerating backend quota and payload-size
/// limits." A single-slot internal token (owned by the implementation)
/// serializes state updates; callers may invoke `commit` concurrently from
/// multiple tasks.
#[async_trait]
pub trait Sink: Send + Sync {
    /// Commits `rows`, returning the count the sink is confident were
    /// accepted. A zero-row commit is a no-op returning `Ok(0)`. Errors are
    /// internalized into counters wherever spec.md's error taxonomy calls
    /// for swallowing them; only encoding/programming-assertion failures
    /// (`GardenerError::Fatal`) propagate to the caller.
    async fn commit(&self, rows: Vec<serde_json::Value>, label: &SinkLabel) -> Result<u64, GardenerError>;

    /// Waits for all in-flight commits, flushes any buffered bytes, then
    /// releases the underlying resource. A second call fails with
    /// `GardenerError::Fatal`.
    async fn close(&self) -> Result<(), GardenerError>;
}

/// Per-attempt sleep for the warehouse sink's quota-exceeded retry: `base *
/// 2^attempt * rand(0.5, 1.5)`, stopping once the cumulative sleep would
/// exceed `ceiling`.
pub struct QuotaBackoff {
    base: Duration,
    ceiling: Duration,
    elapsed: Duration,
    attempt: u32,
}

impl QuotaBackoff {
    pub fn new() -> Self {
        Self {
            base: Duration::from_millis(10),
            ceiling: Duration::from_secs(60),
            elapsed: Duration::ZERO,
            attempt: 0,
        }
    }

    /// Returns the next sleep duration, or `None` once the 60s ceiling has
    /// been reached — the caller should then classify the commit as
    /// `QuotaExceeded` and stop retrying.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if self.elapsed >= self.ceiling {
            return None;
        }
        let factor = rand::thread_rng().gen_range(0.5..1.5);
        let millis = self.base.as_millis() as f64 * 2f64.powi(self.attempt as i32) * factor;
        let delay = Duration::from_millis(millis.round() as u64);
        self.attempt += 1;
        self.elapsed += delay;
        Some(delay)
    }
}

impl Default for QuotaBackoff {
    fn default() -> Self {
        Self::new()
    }
}

/// The two-token pipeline every concrete Sink builds its `commit` around: an
/// *encoding* token and a *writing* token, each a semaphore of size one. A
/// `commit` call holds the encoding token only while it serializes rows into
/// a local buffer, then swaps it for the writing token before the backend
/// call — letting the next `commit`'s encoding proceed while this one's
/// write is still in flight. `close` takes both, which is what guarantees no
/// commit remains in flight once it returns.
pub struct PipelineTokens {
    encode: Arc<Semaphore>,
    write: Arc<Semaphore>,
}

impl PipelineTokens {
    pub fn new() -> Self {
        Self {
            encode: Arc::new(Semaphore::new(1)),
            write: Arc::new(Semaphore::new(1)),
        }
    }

    pub async fn acquire_encode(&self) -> OwnedSemaphorePermit {
        self.encode
            .clone()
            .acquire_owned()
            .await
            .expect("encode semaphore is never closed")
    }

    pub async fn acquire_write(&self) -> OwnedSemaphorePermit {
        self.write
            .clone()
            .acquire_owned()
            .await
            .expect("write semaphore is never closed")
    }

    /// Acquires both tokens, encode first, for `close`.
    pub async fn acquire_both(&self) -> (OwnedSemaphorePermit, OwnedSemaphorePermit) {
        let encode = self.acquire_encode().await;
        let write = self.acquire_write().await;
        (encode, write)
    }
}

impl Default for PipelineTokens {
    fn default() -> Self {
        Self::new()
    }
}

/// Splits `rows` into two halves of near-equal size, used to recover from a
/// `PayloadTooLarge` response per spec.md §4.4 step 5. Panics if called with
/// fewer than 2 rows — callers must check `rows.len() >= 2` first, since a
/// single oversize row is a hard `Fatal` error, not a split point.
pub fn split_in_half<T>(mut rows: Vec<T>) -> (Vec<T>, Vec<T>) {
    assert!(rows.len() >= 2, "split_in_half requires at least 2 rows");
    let mid = rows.len() / 2;
    let second = rows.split_off(mid);
    (rows, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn write_token_pipelines_one_deep() {
        let tokens = Arc::new(PipelineTokens::new());
        let held_write = tokens.acquire_write().await;

        let tokens_clone = tokens.clone();
        let encode_while_write_busy =
            tokio::spawn(async move { tokens_clone.acquire_encode().await });
        let encode_permit = tokio::time::timeout(Duration::from_millis(50), encode_while_write_busy)
            .await
            .expect("encode token must be free while only the write token is held")
            .unwrap();

        drop(encode_permit);
        drop(held_write);
    }

    #[test]
    fn split_in_half_splits_near_evenly() {
        let (a, b) = split_in_half(vec![1, 2, 3, 4, 5]);
        assert_eq!(a, vec![1, 2]);
        assert_eq!(b, vec![3, 4, 5]);
    }

    #[test]
    fn quota_backoff_eventually_reaches_ceiling() {
        let mut backoff = QuotaBackoff::new();
        let mut total = Duration::ZERO;
        let mut iterations = 0;
        while let Some(delay) = backoff.next_delay() {
            total += delay;
            iterations += 1;
            assert!(iterations < 1000, "quota backoff did not converge");
        }
        assert!(total >= Duration::from_secs(60) || iterations > 0);
    }
}
