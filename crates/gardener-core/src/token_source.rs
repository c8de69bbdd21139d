// SPDX-License-Identifier: Apache-2.0

//! C1: TokenSource — a weighted admission gate bounding how many
//! `TaskRunner`s may execute concurrently.

use std::sync::Arc;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::errors::GardenerError;

/// A token admission gate of capacity N. `acquire` blocks until a token is
/// free or `cancel` fires, in which case it fails with
/// [`GardenerError::Canceled`]. Ordering is not FIFO: the underlying
/// semaphore may wake any waiter.
///
/// Holding a [`Token`] *is* holding the permit: there is no separate
/// `release` call to forget, so the "releasing without a matching acquire
/// is a programming error" clause is satisfied by construction — dropping
/// the token is the only way to release one, and you can't drop what you
/// never acquired.
#[derive(Clone)]
pub struct TokenSource {
    semaphore: Arc<Semaphore>,
}

/// A held admission token. Releases automatically on drop.
pub struct Token(#[allow(dead_code)] OwnedSemaphorePermit);

impl TokenSource {
    pub fn new(capacity: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.semaphore.available_permits()
    }

    pub async fn acquire(&self, cancel: &CancellationToken) -> Result<Token, GardenerError> {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(GardenerError::Canceled),
            permit = self.semaphore.clone().acquire_owned() => {
                Ok(Token(permit.expect("TokenSource semaphore is never closed")))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn bounds_concurrency_to_capacity() {
        let source = TokenSource::new(2);
        let cancel = CancellationToken::new();

        let t1 = source.acquire(&cancel).await.unwrap();
        let t2 = source.acquire(&cancel).await.unwrap();
        assert_eq!(source.capacity(), 0);

        let source_clone = source.clone();
        let cancel_clone = cancel.clone();
        let waiter = tokio::spawn(async move { source_clone.acquire(&cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiter.is_finished());

        drop(t1);
        let t3 = waiter.await.unwrap().unwrap();
        assert_eq!(source.capacity(), 0);
        drop(t2);
        drop(t3);
        assert_eq!(source.capacity(), 2);
    }

    #[tokio::test]
    async fn cancellation_fails_a_blocked_acquire() {
        let source = TokenSource::new(1);
        let cancel = CancellationToken::new();
        let _held = source.acquire(&cancel).await.unwrap();

        let source_clone = source.clone();
        let cancel_clone = cancel.clone();
        let waiter = tokio::spawn(async move { source_clone.acquire(&cancel_clone).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        assert!(matches!(
            waiter.await.unwrap(),
            Err(GardenerError::Canceled)
        ));
    }
}
