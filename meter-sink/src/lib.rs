//! Kafka to ClickHouse sink for metering events.
//!
//! Records are read from per-namespace topics, validated against the meters
//! defined for their namespace, and stored in batches. Offsets are committed
//! only after the batch holding them is durably stored.

pub mod admin;
pub mod buffer;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod health;
pub mod json_path;
pub mod kafka;
pub mod meter_cache;
pub mod metrics_consts;
pub mod notification;
pub mod rebalance;
pub mod retry;
pub mod service;
pub mod sink;
pub mod storage;
pub mod test_utils;
pub mod types;
pub mod validator;

pub use error::{ErrorKind, SinkError};
