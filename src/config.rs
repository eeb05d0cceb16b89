//! Session configuration, read from a RON file.
//!
//! Every field has a default, so an empty file (or no file) gives the
//! clinical defaults. Command-line flags are applied on top.

use crate::device::DeviceSettings;
use crate::exercise::{Catalog, CatalogError, EngineSettings};
use crate::session::SELECTION_FILE;

use serde::{Deserialize, Serialize};
use std::{
    fs,
    path::{Path, PathBuf},
    time::Duration,
};

/// Where the HMD listens unless told otherwise.
pub const DEFAULT_HMD_ADDR: &str = "127.0.0.1:9003";

/// Problems loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The file could not be read.
    #[error("could not read config {path}: {source}")]
    Read {
        /// The file
        path: PathBuf,
        /// Why
        source: std::io::Error,
    },
    /// The file is not valid RON for a [`SessionConfig`].
    #[error("could not parse config: {0}")]
    Parse(#[from] ron::error::SpannedError),
    /// The configured exercise catalog is unusable.
    #[error(transparent)]
    Catalog(#[from] CatalogError),
}

/// Everything the binary needs to run a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Settings shared by every sock
    pub device: DeviceSettings,
    /// Exercise timing
    pub engine: EngineSettings,
    /// Address for the handshake server; no server when absent
    pub handshake_bind: Option<String>,
    /// `host:port` of the HMD
    pub hmd_addr: String,
    /// Log HMD messages instead of sending them
    pub bypass_hmd: bool,
    /// Where the external port picker drops its choice
    pub selection_file: PathBuf,
    /// How often to look for the selection file
    pub selection_poll: Duration,
    /// RON exercise catalog; the built-in program when absent
    pub exercise_catalog: Option<PathBuf>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            device: DeviceSettings::default(),
            engine: EngineSettings::default(),
            handshake_bind: None,
            hmd_addr: DEFAULT_HMD_ADDR.to_string(),
            bypass_hmd: false,
            selection_file: PathBuf::from(SELECTION_FILE),
            selection_poll: Duration::from_millis(500),
            exercise_catalog: None,
        }
    }
}

impl SessionConfig {
    /// Parse a RON document.
    pub fn from_ron(text: &str) -> Result<Self, ConfigError> {
        Ok(ron::from_str(text)?)
    }

    /// Read and parse `path`.
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_ron(&text)
    }

    /// The configured catalog, or the built-in one.
    pub fn load_catalog(&self) -> Result<Catalog, ConfigError> {
        match &self.exercise_catalog {
            Some(path) => Ok(Catalog::from_path(path)?),
            None => Ok(Catalog::builtin()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn empty_document_is_default() {
        assert_eq!(SessionConfig::from_ron("()").unwrap(), SessionConfig::default());
    }

    #[test]
    fn partial_document_keeps_other_defaults() {
        let config = SessionConfig::from_ron(
            r#"(
                hmd_addr: "10.0.0.7:9003",
                bypass_hmd: true,
                handshake_bind: Some("0.0.0.0:7000"),
                device: (identity_attempts: 5, log_dir: "/var/log/socks"),
                engine: (preparation_bound: 1.5),
            )"#,
        )
        .unwrap();

        assert_eq!(config.hmd_addr, "10.0.0.7:9003");
        assert!(config.bypass_hmd);
        assert_eq!(config.handshake_bind.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(config.device.identity_attempts, 5);
        assert_eq!(config.device.log_dir, PathBuf::from("/var/log/socks"));
        assert_eq!(config.device.identity_poll, Duration::from_millis(500));
        assert_eq!(config.engine.preparation_bound, 1.5);
        assert_eq!(config.engine.loss_threshold, Duration::from_secs(4));
        assert_eq!(config.selection_file, PathBuf::from(SELECTION_FILE));
    }

    #[test]
    fn sample_session_file_loads() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("session.ron");
        let config = SessionConfig::from_path(&path).unwrap();
        assert_eq!(config.handshake_bind.as_deref(), Some("0.0.0.0:7000"));
        assert_eq!(config.device.log_dir, PathBuf::from("logs"));
        assert_eq!(config.engine, EngineSettings::default());
    }

    #[test]
    fn unknown_syntax_is_a_parse_error() {
        assert!(matches!(
            SessionConfig::from_ron("(hmd_addr: )"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = SessionConfig::from_path(Path::new("/definitely/not/here.ron")).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }

    #[test]
    fn catalog_from_file_or_builtin() {
        let config = SessionConfig::default();
        assert_eq!(config.load_catalog().unwrap(), Catalog::builtin());

        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut catalog = Catalog::builtin();
        catalog.exercises.truncate(2);
        catalog.repeat_groups.remove(&8);
        file.write_all(catalog.to_ron().unwrap().as_bytes()).unwrap();

        let config = SessionConfig {
            exercise_catalog: Some(file.path().to_path_buf()),
            ..SessionConfig::default()
        };
        assert_eq!(config.load_catalog().unwrap().exercises.len(), 2);
    }
}
