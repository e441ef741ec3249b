use kafka_types::OffsetError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to read secret (name: {name}, key: {key}): {source}")]
    Secret {
        name: String,
        key: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to connect: {0}")]
    Connect(String),

    #[error("Kafka consumer failed with error: {0}")]
    ConsumeFatal(String),

    #[error("Admin request failed: {0}")]
    Admin(String),

    #[error("Failed to commit offsets: {0}")]
    Commit(String),

    #[error(transparent)]
    Offset(#[from] OffsetError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Kafka source is closed")]
    Closed,
}

pub type Result<T> = std::result::Result<T, Error>;
