use std::path::{Path, PathBuf};
use std::time::Duration;

use scriptgate_core::{Element, XmlError};

use super::timestamp::DEFAULT_CHECK_INTERVAL;

// ---------------------------------------------------------------------------
// ConfigError
// ---------------------------------------------------------------------------

/// Errors raised while loading configuration or handler definitions.
///
/// A configuration error during a reload leaves the previously published
/// definitions in place.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid XML in {path}: {source}")]
    Xml {
        path: PathBuf,
        #[source]
        source: XmlError,
    },

    #[error("root tag of the configuration should be <configuration>, found <{0}>")]
    InvalidRoot(String),

    #[error("required setting {0} is not set")]
    MissingSetting(&'static str),

    #[error("invalid value for {name}: {value:?}")]
    InvalidSetting { name: &'static str, value: String },

    #[error("{kind} does not exist: {path}")]
    MissingFile { kind: &'static str, path: PathBuf },

    #[error("include cycle through {0}")]
    IncludeCycle(PathBuf),

    #[error("no script engine for file {0}")]
    UnsupportedScript(PathBuf),

    #[error("unknown pre-processor {0:?}")]
    UnknownPreProcessor(String),

    #[error("pre-processor {name:?} for {locator} failed to initialize: {message}")]
    PreProcessorInit {
        name: String,
        locator: String,
        message: String,
    },
}

// ---------------------------------------------------------------------------
// ConnectorConfig
// ---------------------------------------------------------------------------

/// Connector-level configuration.
///
/// Loaded from a `<configuration>` document; relative paths resolve against
/// the directory holding that document.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Root handler definition file.
    pub definition_file: PathBuf,
    /// Optional file of custom properties exposed to handlers.
    pub custom_property_file: Option<PathBuf>,
    /// Directory for persisted transactions. Persistence is off when unset.
    pub transaction_dir: Option<PathBuf>,
    /// Timeout applied to synchronous outbound requests.
    pub request_timeout: Duration,
    /// Upper bound of the sequence probe for one transaction identifier.
    pub max_files_per_transaction: u32,
    /// Minimum time between real modification checks on a watched file.
    pub reload_check_interval: Duration,
}

impl Default for ConnectorConfig {
    fn default() -> Self {
        Self {
            definition_file: PathBuf::new(),
            custom_property_file: None,
            transaction_dir: None,
            request_timeout: Duration::from_secs(30),
            max_files_per_transaction: 500,
            reload_check_interval: DEFAULT_CHECK_INTERVAL,
        }
    }
}

impl ConnectorConfig {
    /// Reads a configuration document from disk.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] if the file cannot be read or any setting is
    /// missing or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let root = Element::parse(&text).map_err(|source| ConfigError::Xml {
            path: path.to_path_buf(),
            source,
        })?;
        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        Self::from_xml(&root, base_dir)
    }

    /// Builds the configuration from a `<configuration>` element.
    ///
    /// Recognised children: `configFile` (required), `customPropertyFile`,
    /// `txnSaveFolder`, `soapRequestTimeout` (seconds, fractions allowed) and
    /// `maxFiles`. The transaction folder is created when missing.
    ///
    /// # Errors
    ///
    /// Returns a [`ConfigError`] naming the offending setting.
    pub fn from_xml(root: &Element, base_dir: &Path) -> Result<Self, ConfigError> {
        if root.local_name() != "configuration" {
            return Err(ConfigError::InvalidRoot(root.name().to_string()));
        }
        let setting = |name: &str| {
            root.child(name)
                .map(|el| el.text().trim().to_string())
                .filter(|value| !value.is_empty())
        };
        let resolve = |value: String| {
            let path = PathBuf::from(value);
            if path.is_absolute() {
                path
            } else {
                base_dir.join(path)
            }
        };

        let mut config = Self::default();

        let definition_file = setting("configFile")
            .map(resolve)
            .ok_or(ConfigError::MissingSetting("configFile"))?;
        if !definition_file.exists() {
            return Err(ConfigError::MissingFile {
                kind: "configuration file",
                path: definition_file,
            });
        }
        config.definition_file = definition_file;

        if let Some(path) = setting("customPropertyFile").map(resolve) {
            if !path.exists() {
                return Err(ConfigError::MissingFile {
                    kind: "custom property file",
                    path,
                });
            }
            config.custom_property_file = Some(path);
        }

        if let Some(path) = setting("txnSaveFolder").map(resolve) {
            std::fs::create_dir_all(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            tracing::debug!(folder = %path.display(), "saving transactions");
            config.transaction_dir = Some(path);
        }

        if let Some(value) = setting("soapRequestTimeout") {
            config.request_timeout = value
                .parse::<f64>()
                .ok()
                .and_then(|secs| Duration::try_from_secs_f64(secs).ok())
                .ok_or(ConfigError::InvalidSetting {
                    name: "soapRequestTimeout",
                    value,
                })?;
        }

        if let Some(value) = setting("maxFiles") {
            config.max_files_per_transaction = value
                .parse::<u32>()
                .ok()
                .filter(|max| *max > 0)
                .ok_or(ConfigError::InvalidSetting {
                    name: "maxFiles",
                    value,
                })?;
        }

        Ok(config)
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
