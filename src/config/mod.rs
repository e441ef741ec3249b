//! Loading the source configuration.
//!
//! The configuration document is taken from the `KAFKA_CONFIG` environment
//! variable when it is set, and otherwise read from the mounted config volume.
//! `CONFIG_FORMAT` selects the document format.

pub mod duration;

use std::path::Path;
use std::str::FromStr;

use anyhow::Context;
use kafka_source_core::{Config, ConfigParser, YamlConfigParser};

/// Environment variable holding the whole configuration document.
pub const CONFIG_ENV: &str = "KAFKA_CONFIG";
/// Environment variable selecting the document format.
pub const CONFIG_FORMAT_ENV: &str = "CONFIG_FORMAT";
/// Directory the configuration volume is mounted at.
pub const CONFIG_VOLUME_PATH: &str = "/etc/config";
/// File name of the configuration document inside the volume.
pub const CONFIG_FILE_NAME: &str = "kafka-config.yaml";

/// Supported configuration document formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Yaml,
}

impl ConfigFormat {
    pub fn parser(&self) -> Box<dyn ConfigParser> {
        match self {
            ConfigFormat::Yaml => Box::new(YamlConfigParser),
        }
    }
}

impl FromStr for ConfigFormat {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "" | "yaml" => Ok(ConfigFormat::Yaml),
            other => anyhow::bail!("Unsupported config format: {other}"),
        }
    }
}

/// Parse and validate a configuration document.
pub fn parse_config(document: &str, format: ConfigFormat) -> anyhow::Result<Config> {
    let config = format.parser().parse(document)?;
    config.validate()?;
    Ok(config)
}

/// Load the configuration from `inline` when given, otherwise from `file`.
pub fn load_config(
    inline: Option<&str>,
    file: &Path,
    format: ConfigFormat,
) -> anyhow::Result<Config> {
    match inline.filter(|document| !document.trim().is_empty()) {
        Some(document) => {
            tracing::debug!("Loading Kafka source config from {CONFIG_ENV}");
            parse_config(document, format).with_context(|| format!("Invalid config in {CONFIG_ENV}"))
        }
        None => {
            tracing::debug!("Loading Kafka source config from {}", file.display());
            let document = std::fs::read_to_string(file)
                .with_context(|| format!("Failed to read config file {}", file.display()))?;
            parse_config(&document, format)
                .with_context(|| format!("Invalid config in {}", file.display()))
        }
    }
}
