pub mod client;
pub mod config;
pub mod consumer;
pub mod context;

pub use client::{LogClient, LogEvent, LogRecord};
pub use config::ConsumerConfigBuilder;
pub use consumer::{classify_poll_error, poll_backoff, KafkaLogClient, PollErrorOrigin};
