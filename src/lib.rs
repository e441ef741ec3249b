//! Runner for the Kafka source.
//!
//! The adapter itself lives in `kafka-source-core`. This crate loads its
//! configuration from the environment or the mounted config volume and drains
//! the topic with a read/ack loop until interrupted.

pub mod config;
pub mod drain;

pub use drain::{drain, shutdown_on_ctrl_c, BatchSource, DrainOptions, DrainStats};
