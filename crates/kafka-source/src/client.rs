//! librdkafka client configuration for the consumer group and the admin client.
//!
//! Properties are layered in this order, later layers winning:
//!
//! 1. source defaults
//! 2. the user's raw `config` properties
//! 3. properties the source depends on (brokers, group, offset storage,
//!    assignment strategy)
//! 4. resolved TLS/SASL transport properties

use std::collections::BTreeMap;

use rdkafka::config::{ClientConfig, RDKafkaLogLevel};
use tracing::warn;

use crate::config::Config;
use crate::error::Result;
use crate::transport::TransportConfig;

/// Properties the source sets itself. User supplied values are ignored.
///
/// Sessions end on every rebalance, so only eager assignment keeps undelivered
/// records of retained partitions from being skipped.
const RESERVED_PROPERTIES: &[&str] = &[
    "bootstrap.servers",
    "group.id",
    "enable.auto.offset.store",
    "partition.assignment.strategy",
];

/// Client config for the consumer group.
///
/// Offsets are stored only when the source marks them, and stored offsets are
/// committed by librdkafka's periodic auto-commit as well as on session
/// teardown.
pub fn consumer_client_config(
    config: &Config,
    transport: &TransportConfig,
) -> Result<ClientConfig> {
    let mut client = ClientConfig::new();
    client
        .set("enable.auto.commit", "true")
        .set("enable.partition.eof", "false")
        .set("auto.offset.reset", "earliest")
        .set_log_level(RDKafkaLogLevel::Info);

    apply_user_properties(&mut client, &config.client_properties()?);
    apply_reserved_properties(&mut client, config);
    transport.apply(&mut client);
    Ok(client)
}

/// Client config for the admin client used to compute pending counts.
///
/// The admin client shares the consumer group id so it can read the group's
/// committed offsets, but never subscribes and never commits.
pub fn admin_client_config(config: &Config, transport: &TransportConfig) -> Result<ClientConfig> {
    let mut client = ClientConfig::new();
    client.set_log_level(RDKafkaLogLevel::Warning);

    apply_user_properties(&mut client, &config.client_properties()?);
    apply_reserved_properties(&mut client, config);
    client.set("enable.auto.commit", "false");
    transport.apply(&mut client);
    Ok(client)
}

fn apply_user_properties(client: &mut ClientConfig, properties: &BTreeMap<String, String>) {
    for (key, value) in properties {
        if RESERVED_PROPERTIES.contains(&key.as_str()) {
            warn!(property = %key, "Ignoring client property set by the source itself");
            continue;
        }
        client.set(key, value);
    }
}

fn apply_reserved_properties(client: &mut ClientConfig, config: &Config) {
    client
        .set("bootstrap.servers", config.brokers.join(","))
        .set("group.id", &config.consumer_group)
        .set("enable.auto.offset.store", "false")
        .set("partition.assignment.strategy", "range");
}
