// SPDX-License-Identifier: Apache-2.0

//! Core job-execution subsystem for a Gardener worker: the eight components
//! that turn coordinator-issued jobs into rows committed to a sink.
//!
//! This crate is transport-agnostic. `Coordinator` and `Sink` are traits;
//! the concrete HTTP coordinator client and warehouse/object-store sinks
//! live in `gardener-worker` and `gardener-sinks` respectively, which keeps
//! every component here testable against in-memory fakes.

pub mod archive_key;
pub mod archive_listing;
pub mod archive_reader;
pub mod coordinator;
pub mod errors;
pub mod job_executor;
pub mod model;
pub mod poller;
pub mod runnable_source;
pub mod sink;
pub mod task_runner;
pub mod token_source;

pub use archive_key::ArchiveKey;
pub use archive_listing::ArchiveListing;
pub use archive_reader::{ArchiveReader, ReaderOptions};
pub use coordinator::Coordinator;
pub use errors::{GardenerError, GardenerResult};
pub use job_executor::{JobExecutor, ParserFactory};
pub use model::{ArchiveDescriptor, Job, JobState, RowBatch, SinkCounters, SinkLabel, TestEntry};
pub use poller::Poller;
pub use runnable_source::{RunnableSource, RunnableTask};
pub use sink::{PipelineTokens, QuotaBackoff, Sink, split_in_half};
pub use task_runner::{Annotator, Parser, TaskRunner};
pub use token_source::{Token, TokenSource};
