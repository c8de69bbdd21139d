// SPDX-License-Identifier: Apache-2.0

//! Binary-side wiring: configuration, the coordinator HTTP client, and a
//! demonstration parser. `main.rs` assembles these into a running
//! `Poller`.

pub mod client;
pub mod config;
pub mod control;
pub mod ndt_parser;

pub use client::GardenerClient;
pub use config::{OutputMode, SinkScope, WorkerConfig};
pub use control::StatusPage;
pub use ndt_parser::{NdtParser, SinkFactory};
