// SPDX-License-Identifier: Apache-2.0

//! Error taxonomy for the job execution subsystem.
//!
//! Mirrors the indexing pipeline's own `IngestionError`: external error types
//! are wired in via `#[from]`, and the taxonomy's named variants are
//! constructed explicitly at the call sites that classify a failure.

pub type GardenerResult<T, E = GardenerError> = std::result::Result<T, E>;

#[derive(thiserror::Error, Debug)]
#[non_exhaustive]
pub enum GardenerError {
    /// Archive key parse failure, unknown data-type. Rejected immediately,
    /// counted, never retried.
    #[error("invalid input: {0}")]
    InvalidInput(String),

    /// Object-store read, coordinator call, or non-quota 5xx from the
    /// streaming-insert backend, after the retry budget is exhausted.
    #[error("transient failure: {0}")]
    Transient(String),

    /// Warehouse streaming-insert quota rejection, after the randomized
    /// backoff ceiling (~60s total) is reached.
    #[error("quota exceeded")]
    QuotaExceeded,

    /// Warehouse single-request payload limit, on a batch that could not be
    /// split any further (a single row still too large).
    #[error("payload too large")]
    PayloadTooLarge,

    /// A per-row warehouse error or parser malformed-row signal. Counted into
    /// `bad`, never surfaced as a Commit failure.
    #[error("row rejected: {0}")]
    RowRejected(String),

    /// Encoding errors, programming-assertion failures (e.g. Close after
    /// Close), or any other condition that must terminate the owning
    /// TaskRunner.
    #[error("fatal: {0}")]
    Fatal(String),

    /// Cancellation signal observed; callers propagate this without further
    /// action.
    #[error("canceled")]
    Canceled,

    #[error(transparent)]
    ObjectStore(#[from] object_store::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl GardenerError {
    /// True for the error kinds spec.md §7 assigns to "retry with backoff".
    pub fn is_transient(&self) -> bool {
        matches!(self, GardenerError::Transient(_) | GardenerError::ObjectStore(_))
    }
}
