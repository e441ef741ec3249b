//! Resolution of TLS and SASL settings into librdkafka properties.
//!
//! Secrets are read once, here. The resulting [`TransportConfig`] is an
//! immutable value that every client the source builds (the consumer group and
//! each generation of the admin client) is configured from.

use std::collections::BTreeMap;
use std::fmt;

use rdkafka::config::ClientConfig;
use tracing::{debug, warn};

use crate::config::{GssapiConfig, Krb5AuthType, SaslConfig, SaslMechanism, SaslPlain, TlsConfig};
use crate::error::{Error, Result};
use crate::secrets::VolumeReader;

/// Properties whose values must never show up in logs.
const REDACTED_PROPERTIES: &[&str] = &["sasl.password", "ssl.key.pem", "ssl.key.password"];

/// Resolved transport and authentication properties.
#[derive(Clone, Default, PartialEq, Eq)]
pub struct TransportConfig {
    properties: BTreeMap<String, String>,
}

impl TransportConfig {
    /// Resolve declarative TLS/SASL settings, reading secrets through `reader`.
    pub fn resolve(
        tls: Option<&TlsConfig>,
        sasl: Option<&SaslConfig>,
        reader: &dyn VolumeReader,
    ) -> Result<Self> {
        let mut properties = BTreeMap::new();

        let protocol = match (tls.is_some(), sasl.is_some()) {
            (false, false) => "plaintext",
            (true, false) => "ssl",
            (false, true) => "sasl_plaintext",
            (true, true) => "sasl_ssl",
        };
        properties.insert("security.protocol".to_string(), protocol.to_string());

        if let Some(tls) = tls {
            resolve_tls(tls, reader, &mut properties)?;
        }
        if let Some(sasl) = sasl {
            resolve_sasl(sasl, reader, &mut properties)?;
        }

        debug!(security_protocol = protocol, "Resolved Kafka transport config");
        Ok(Self { properties })
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Copy every resolved property onto `client`.
    pub fn apply(&self, client: &mut ClientConfig) {
        for (key, value) in &self.properties {
            client.set(key, value);
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut map = f.debug_map();
        for (key, value) in &self.properties {
            if REDACTED_PROPERTIES.contains(&key.as_str()) {
                map.entry(key, &"<redacted>");
            } else {
                map.entry(key, value);
            }
        }
        map.finish()
    }
}

fn resolve_tls(
    tls: &TlsConfig,
    reader: &dyn VolumeReader,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    if let Some(ca) = &tls.ca_cert_secret {
        properties.insert("ssl.ca.pem".to_string(), reader.secret_value(ca)?);
    }

    match (&tls.cert_secret, &tls.key_secret) {
        (Some(cert), Some(key)) => {
            properties.insert("ssl.certificate.pem".to_string(), reader.secret_value(cert)?);
            properties.insert("ssl.key.pem".to_string(), reader.secret_value(key)?);
        }
        (None, None) => {}
        _ => {
            return Err(Error::Config(
                "clientCertSecret and clientKeySecret must be set together".to_string(),
            ))
        }
    }

    if tls.insecure_skip_verify {
        properties.insert(
            "enable.ssl.certificate.verification".to_string(),
            "false".to_string(),
        );
    }
    Ok(())
}

fn resolve_sasl(
    sasl: &SaslConfig,
    reader: &dyn VolumeReader,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    let mechanism = sasl
        .mechanism
        .ok_or_else(|| Error::Config("sasl.mechanism is required".to_string()))?;

    match mechanism {
        SaslMechanism::Plain => {
            let plain = sasl.plain.as_ref().ok_or_else(|| {
                Error::Config("sasl.plain is required for mechanism PLAIN".to_string())
            })?;
            properties.insert("sasl.mechanism".to_string(), "PLAIN".to_string());
            resolve_plain(plain, reader, properties)
        }
        SaslMechanism::Gssapi => {
            let gssapi = sasl.gssapi.as_ref().ok_or_else(|| {
                Error::Config("sasl.gssapi is required for mechanism GSSAPI".to_string())
            })?;
            properties.insert("sasl.mechanism".to_string(), "GSSAPI".to_string());
            resolve_gssapi(gssapi, reader, properties)
        }
        other => Err(Error::Config(format!("SASL mechanism not supported: {other}"))),
    }
}

fn resolve_plain(
    plain: &SaslPlain,
    reader: &dyn VolumeReader,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    if let Some(user) = &plain.user_secret {
        properties.insert("sasl.username".to_string(), reader.secret_value(user)?);
    }
    if let Some(password) = &plain.password_secret {
        properties.insert("sasl.password".to_string(), reader.secret_value(password)?);
    }
    if plain.handshake_disabled() {
        warn!("sasl.plain.handshake=false is ignored, librdkafka always performs the SASL handshake");
    }
    Ok(())
}

fn resolve_gssapi(
    gssapi: &GssapiConfig,
    reader: &dyn VolumeReader,
    properties: &mut BTreeMap<String, String>,
) -> Result<()> {
    let auth_type = gssapi.auth_type.ok_or_else(|| {
        Error::Config(
            "failed to parse GSSAPI AuthType. Must be one of the following: ['KRB5_USER_AUTH', 'KRB5_KEYTAB_AUTH']"
                .to_string(),
        )
    })?;

    if !gssapi.service_name.is_empty() {
        properties.insert(
            "sasl.kerberos.service.name".to_string(),
            gssapi.service_name.clone(),
        );
    }

    if let Some(username) = &gssapi.username_secret {
        let username = reader.secret_value(username)?;
        let principal = if gssapi.realm.is_empty() {
            username
        } else {
            format!("{username}@{}", gssapi.realm)
        };
        properties.insert("sasl.kerberos.principal".to_string(), principal);
    }

    let env = match &gssapi.kerberos_config_secret {
        Some(krb_config) => {
            let path = readable_secret_path(reader, krb_config, "kerberos config")?;
            format!("KRB5_CONFIG=\"{path}\" ")
        }
        None => String::new(),
    };

    let kinit = match auth_type {
        Krb5AuthType::Keytab => {
            let keytab = gssapi.keytab_secret.as_ref().ok_or_else(|| {
                Error::Config("keytabSecret is required for KRB5_KEYTAB_AUTH".to_string())
            })?;
            let path = readable_secret_path(reader, keytab, "keytab")?;
            properties.insert("sasl.kerberos.keytab".to_string(), path);
            format!(
                "{env}kinit -R -t \"%{{sasl.kerberos.keytab}}\" -k %{{sasl.kerberos.principal}} || \
                 {env}kinit -t \"%{{sasl.kerberos.keytab}}\" -k %{{sasl.kerberos.principal}}"
            )
        }
        Krb5AuthType::User => {
            let password = gssapi.password_secret.as_ref().ok_or_else(|| {
                Error::Config("passwordSecret is required for KRB5_USER_AUTH".to_string())
            })?;
            let path = readable_secret_path(reader, password, "password")?;
            format!("{env}kinit %{{sasl.kerberos.principal}} < \"{path}\"")
        }
    };
    properties.insert("sasl.kerberos.kinit.cmd".to_string(), kinit);
    Ok(())
}

fn readable_secret_path(
    reader: &dyn VolumeReader,
    selector: &crate::config::SecretKeySelector,
    what: &str,
) -> Result<String> {
    let path = reader.secret_path(selector);
    std::fs::metadata(&path).map_err(|e| {
        Error::Config(format!("failed to read {what} file {}: {e}", path.display()))
    })?;
    Ok(path.display().to_string())
}
