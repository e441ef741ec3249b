//! Access to secrets mounted as files.
//!
//! Every secret lives at `<root>/<name>/<key>`.

use std::path::PathBuf;

use crate::config::SecretKeySelector;
use crate::error::{Error, Result};

/// Root directory of all mounted secrets.
pub const SECRET_VOLUME_PATH: &str = "/etc/secrets";

/// Resolves secret selectors to file paths and contents.
pub trait VolumeReader: Send + Sync {
    /// Read a secret, stripping one trailing newline.
    fn secret_value(&self, selector: &SecretKeySelector) -> Result<String>;

    /// Path of the mounted secret file.
    fn secret_path(&self, selector: &SecretKeySelector) -> PathBuf;
}

/// [`VolumeReader`] over a directory of mounted secrets.
#[derive(Debug, Clone)]
pub struct SecretVolumeReader {
    root: PathBuf,
}

impl SecretVolumeReader {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl Default for SecretVolumeReader {
    fn default() -> Self {
        Self::new(SECRET_VOLUME_PATH)
    }
}

impl VolumeReader for SecretVolumeReader {
    fn secret_value(&self, selector: &SecretKeySelector) -> Result<String> {
        let path = self.secret_path(selector);
        let data = std::fs::read_to_string(&path).map_err(|source| Error::Secret {
            name: selector.name.clone(),
            key: selector.key.clone(),
            source,
        })?;
        Ok(data.strip_suffix('\n').unwrap_or(&data).to_string())
    }

    fn secret_path(&self, selector: &SecretKeySelector) -> PathBuf {
        self.root.join(&selector.name).join(&selector.key)
    }
}
