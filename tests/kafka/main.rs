//! Kafka source E2E tests
//!
//! These run against the broker at `kafka:9092` from the dev container and are
//! ignored by default. Run them with `cargo test --test kafka -- --ignored`.

mod read_ack_pending;
