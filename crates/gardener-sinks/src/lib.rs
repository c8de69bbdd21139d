// SPDX-License-Identifier: Apache-2.0

//! Concrete `Sink` (C4) implementations: `ObjectStoreSink`, writing one
//! line-delimited JSON object per archive, and `WarehouseSink`, streaming
//! rows into a BigQuery-style warehouse table.

pub mod object_store_sink;
pub mod warehouse_sink;

pub use object_store_sink::ObjectStoreSink;
pub use warehouse_sink::WarehouseSink;
