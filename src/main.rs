//! Command-line interface for kafka-source
//!
//! # Usage Examples
//!
//! ## Drain a topic
//! ```bash
//! # Config from the environment
//! KAFKA_CONFIG="$(cat kafka-config.yaml)" kafka-source run --batch-size 500
//!
//! # Config from the mounted volume, secrets from a custom directory
//! kafka-source run \
//!   --config-file /etc/config/kafka-config.yaml \
//!   --secret-root ./secrets \
//!   --read-timeout 500ms
//! ```
//!
//! ## Check a config document
//! ```bash
//! kafka-source check-config --config-file kafka-config.yaml
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::{Args, Parser, Subcommand};
use kafka_source::config::duration::parse_duration;
use kafka_source::config::{
    load_config, ConfigFormat, CONFIG_ENV, CONFIG_FILE_NAME, CONFIG_FORMAT_ENV,
    CONFIG_VOLUME_PATH,
};
use kafka_source::{drain, shutdown_on_ctrl_c, DrainOptions};
use kafka_source_core::{
    Config, KafkaSource, SecretVolumeReader, SourceOptions, SECRET_VOLUME_PATH,
};
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "kafka-source")]
#[command(about = "Pull-based Kafka source with read, ack and pending semantics")]
#[command(long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Join the consumer group and drain the topic until interrupted
    Run {
        #[command(flatten)]
        config: ConfigArgs,

        /// Directory the secret volume is mounted at
        #[arg(long, default_value = SECRET_VOLUME_PATH)]
        secret_root: PathBuf,

        /// Maximum number of messages per read
        #[arg(long, default_value_t = 100)]
        batch_size: usize,

        /// How long a single read waits for messages (e.g. 500ms, 1s)
        #[arg(long, default_value = "1s", value_parser = parse_duration)]
        read_timeout: Duration,

        /// How often the pending count is logged
        #[arg(long, default_value = "30s", value_parser = parse_duration)]
        pending_interval: Duration,

        /// Capacity of the queue between partition claims and reads
        #[arg(long, default_value_t = 100)]
        buffer_size: usize,
    },

    /// Parse and validate a config document, then print it
    CheckConfig {
        #[command(flatten)]
        config: ConfigArgs,
    },
}

#[derive(Args)]
struct ConfigArgs {
    /// Inline config document, takes precedence over --config-file
    #[arg(long = "config", env = CONFIG_ENV, hide_env_values = true)]
    inline: Option<String>,

    /// Config document on disk
    #[arg(long, default_value_t = default_config_file())]
    config_file: String,

    /// Format of the config document
    #[arg(long, env = CONFIG_FORMAT_ENV, default_value = "yaml")]
    config_format: ConfigFormat,
}

impl ConfigArgs {
    fn load(&self) -> anyhow::Result<Config> {
        load_config(
            self.inline.as_deref(),
            Path::new(&self.config_file),
            self.config_format,
        )
    }
}

fn default_config_file() -> String {
    format!("{CONFIG_VOLUME_PATH}/{CONFIG_FILE_NAME}")
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = run().await {
        eprintln!("Error: {e:#}");
        std::process::exit(1);
    }
    Ok(())
}

async fn run() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            config,
            secret_root,
            batch_size,
            read_timeout,
            pending_interval,
            buffer_size,
        } => {
            let config = config.load()?;
            let options = SourceOptions::default().with_buffer_size(buffer_size);
            let drain_options = DrainOptions {
                batch_size,
                read_timeout,
                pending_interval,
            };
            run_source(&config, options, &secret_root, &drain_options).await
        }
        Commands::CheckConfig { config } => {
            let format = config.config_format;
            let config = config.load()?;
            print!("{}", format.parser().unparse(&config)?);
            Ok(())
        }
    }
}

async fn run_source(
    config: &Config,
    options: SourceOptions,
    secret_root: &Path,
    drain_options: &DrainOptions,
) -> anyhow::Result<()> {
    info!(
        "Starting Kafka source for topic {} in group {}",
        config.topic, config.consumer_group
    );

    let reader = SecretVolumeReader::new(secret_root);
    let source = KafkaSource::with_volume_reader(config, options, &reader).await?;

    info!("Kafka source running. Press Ctrl+C to stop.");
    let drained = drain(&source, drain_options, shutdown_on_ctrl_c()).await;

    if let Err(e) = source.close().await {
        warn!("Error closing Kafka source: {e}");
    }

    let stats = drained?;
    info!(
        "Kafka source stopped after {} messages in {} batches",
        stats.messages, stats.batches
    );
    Ok(())
}
