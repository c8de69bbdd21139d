// SPDX-License-Identifier: Apache-2.0

//! C6: RunnableSource — composes `ArchiveListing` with a `TaskRunner`
//! factory into a lazy sequence, token-throttled so steady-state
//! concurrency never exceeds the wrapping `TokenSource`'s capacity
//! regardless of how a `TaskRunner` exits.

use std::sync::Arc;

use object_store::ObjectStore;
use tokio_util::sync::CancellationToken;

use crate::{
    archive_listing::ArchiveListing,
    archive_reader::ReaderOptions,
    errors::GardenerError,
    task_runner::{Parser, TaskRunner},
    token_source::{Token, TokenSource},
};

/// A `TaskRunner` bundled with the admission token that gates it. Holding
/// the token alive for exactly the bundle's lifetime, released on drop,
/// is what guarantees "one Release per Acquire on every exit path" — there
/// is no code path that runs the task without also eventually dropping
/// this struct, success, error, or panic alike.
pub struct RunnableTask {
    runner: TaskRunner,
    _token: Token,
}

impl RunnableTask {
    pub fn info(&self) -> String {
        self.runner.info()
    }

    pub async fn run(&self, cancel: &CancellationToken) -> Result<(), GardenerError> {
        self.runner.run(cancel).await
    }
}

pub struct RunnableSource {
    listing: ArchiveListing,
    tokens: TokenSource,
    store: Arc<dyn ObjectStore>,
    reader_opts: ReaderOptions,
    parser: Arc<dyn Parser>,
}

impl RunnableSource {
    pub fn new(
        listing: ArchiveListing,
        tokens: TokenSource,
        store: Arc<dyn ObjectStore>,
        reader_opts: ReaderOptions,
        parser: Arc<dyn Parser>,
    ) -> Self {
        Self {
            listing,
            tokens,
            store,
            reader_opts,
            parser,
        }
    }

    /// Returns the next token-guarded `TaskRunner`, or `Ok(None)` on orderly
    /// exhaustion of the underlying listing.
    pub async fn next(
        &mut self,
        cancel: &CancellationToken,
    ) -> Result<Option<RunnableTask>, GardenerError> {
        let token = self.tokens.acquire(cancel).await?;

        match self.listing.next(cancel).await {
            Ok(Some(descriptor)) => {
                // Archive-key validation happens inside `TaskRunner::run`,
                // as its own per-archive fail-fast classification — a bad
                // key is never a listing-level failure, so construction
                // here cannot fail.
                let runner = TaskRunner::new(
                    descriptor,
                    self.store.clone(),
                    self.reader_opts,
                    self.parser.clone(),
                );
                Ok(Some(RunnableTask {
                    runner,
                    _token: token,
                }))
            }
            Ok(None) => {
                drop(token);
                Ok(None)
            }
            Err(err) => {
                drop(token);
                Err(err)
            }
        }
    }
}
