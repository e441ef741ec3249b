//! Declarative source configuration.
//!
//! The field names follow the YAML documents the source is deployed with:
//!
//! ```yaml
//! brokers:
//!   - kafka-broker:9092
//! topic: orders
//! consumerGroup: orders-pipeline
//! config: |
//!   auto.offset.reset: earliest
//! tls:
//!   caCertSecret:
//!     name: kafka-tls
//!     key: ca.crt
//! sasl:
//!   mechanism: PLAIN
//!   plain:
//!     userSecret: { name: kafka-sasl, key: user }
//!     passwordSecret: { name: kafka-sasl, key: password }
//!     handshake: true
//! ```

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{Error, Result};

/// Top-level source configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Bootstrap brokers
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub brokers: Vec<String>,
    /// Topic to consume from
    #[serde(default)]
    pub topic: String,
    /// Consumer group the source joins
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub consumer_group: String,
    /// TLS settings for the broker connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsConfig>,
    /// librdkafka properties as a YAML mapping
    #[serde(default, rename = "config", skip_serializing_if = "String::is_empty")]
    pub raw_client_config: String,
    /// SASL settings for the broker connection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sasl: Option<SaslConfig>,
}

/// Reference to one key of a mounted secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

impl SecretKeySelector {
    pub fn new(name: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: key.into(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsConfig {
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
    /// Secret holding the CA certificate (PEM)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_cert_secret: Option<SecretKeySelector>,
    /// Secret holding the client certificate (PEM)
    #[serde(
        default,
        rename = "clientCertSecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub cert_secret: Option<SecretKeySelector>,
    /// Secret holding the client private key (PEM)
    #[serde(
        default,
        rename = "clientKeySecret",
        skip_serializing_if = "Option::is_none"
    )]
    pub key_secret: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SaslConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mechanism: Option<SaslMechanism>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gssapi: Option<GssapiConfig>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plain: Option<SaslPlain>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SaslMechanism {
    #[serde(rename = "OAUTHBEARER")]
    OAuthBearer,
    #[serde(rename = "PLAIN")]
    Plain,
    #[serde(rename = "SCRAM-SHA-256")]
    ScramSha256,
    #[serde(rename = "SCRAM-SHA-512")]
    ScramSha512,
    #[serde(rename = "GSSAPI")]
    Gssapi,
}

impl fmt::Display for SaslMechanism {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaslMechanism::OAuthBearer => "OAUTHBEARER",
            SaslMechanism::Plain => "PLAIN",
            SaslMechanism::ScramSha256 => "SCRAM-SHA-256",
            SaslMechanism::ScramSha512 => "SCRAM-SHA-512",
            SaslMechanism::Gssapi => "GSSAPI",
        };
        f.write_str(name)
    }
}

/// Kerberos settings for SASL/GSSAPI.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GssapiConfig {
    pub service_name: String,
    pub realm: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_type: Option<Krb5AuthType>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub keytab_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kerberos_config_secret: Option<SecretKeySelector>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Krb5AuthType {
    /// Password based login
    #[serde(rename = "KRB5_USER_AUTH")]
    User,
    /// Keytab based login
    #[serde(rename = "KRB5_KEYTAB_AUTH")]
    Keytab,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaslPlain {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password_secret: Option<SecretKeySelector>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub handshake: Option<bool>,
}

impl SaslPlain {
    /// Whether the document explicitly turns the SASL handshake off.
    pub fn handshake_disabled(&self) -> bool {
        self.handshake == Some(false)
    }
}

impl Config {
    /// Reject configs the adapter cannot start with.
    pub fn validate(&self) -> Result<()> {
        if self.brokers.is_empty() || self.brokers.iter().any(|b| b.trim().is_empty()) {
            return Err(Error::Config(
                "at least one non-empty broker address is required".to_string(),
            ));
        }
        if self.topic.is_empty() {
            return Err(Error::Config("topic is required".to_string()));
        }
        if self.topic.contains(kafka_types::OFFSET_SEPARATOR) {
            return Err(Error::Config(format!(
                "topic {} contains the reserved character '{}'",
                self.topic,
                kafka_types::OFFSET_SEPARATOR
            )));
        }
        if self.consumer_group.is_empty() {
            return Err(Error::Config("consumerGroup is required".to_string()));
        }
        Ok(())
    }

    /// Parse `config` into flat librdkafka properties.
    ///
    /// Nested mappings are joined with `.`, so `auto: {offset: {reset: earliest}}`
    /// and `auto.offset.reset: earliest` are equivalent.
    pub fn client_properties(&self) -> Result<BTreeMap<String, String>> {
        let mut properties = BTreeMap::new();
        if self.raw_client_config.trim().is_empty() {
            return Ok(properties);
        }

        let value: Value = serde_yaml::from_str(&self.raw_client_config)
            .map_err(|e| Error::Config(format!("failed to parse client config: {e}")))?;
        match value {
            Value::Mapping(_) => flatten_properties("", &value, &mut properties)?,
            Value::Null => {}
            other => {
                return Err(Error::Config(format!(
                    "client config must be a mapping of properties, got {other:?}"
                )))
            }
        }
        Ok(properties)
    }
}

fn flatten_properties(
    prefix: &str,
    value: &Value,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    match value {
        Value::Mapping(mapping) => {
            for (key, nested) in mapping {
                let key = scalar_to_string(key).ok_or_else(|| {
                    Error::Config(format!("client config key {key:?} is not a scalar"))
                })?;
                let key = if prefix.is_empty() {
                    key
                } else {
                    format!("{prefix}.{key}")
                };
                flatten_properties(&key, nested, properties)?;
            }
        }
        Value::Sequence(items) => {
            let items = items
                .iter()
                .map(|item| {
                    scalar_to_string(item).ok_or_else(|| {
                        Error::Config(format!("client config list {prefix} must hold scalars"))
                    })
                })
                .collect::<Result<Vec<_>>>()?;
            properties.insert(prefix.to_string(), items.join(","));
        }
        Value::Null => {}
        scalar => {
            if let Some(text) = scalar_to_string(scalar) {
                properties.insert(prefix.to_string(), text);
            }
        }
    }
    Ok(())
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

/// Parses and un-parses [`Config`] documents.
pub trait ConfigParser {
    fn parse(&self, config: &str) -> Result<Config>;
    fn unparse(&self, config: &Config) -> Result<String>;
}

/// YAML formatted configuration documents.
#[derive(Debug, Default, Clone, Copy)]
pub struct YamlConfigParser;

impl ConfigParser for YamlConfigParser {
    fn parse(&self, config: &str) -> Result<Config> {
        serde_yaml::from_str(config)
            .map_err(|e| Error::Config(format!("failed to parse config string: {e}")))
    }

    fn unparse(&self, config: &Config) -> Result<String> {
        serde_yaml::to_string(config)
            .map_err(|e| Error::Config(format!("failed to un-parse config: {e}")))
    }
}
