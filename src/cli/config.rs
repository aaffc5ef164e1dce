//! CLI Configuration.
//!
//! Where the ledger lives on disk and how the driver behaves by default.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

// ═══════════════════════════════════════════════════════════════════════════════
// CLI CONFIGURATION
// ═══════════════════════════════════════════════════════════════════════════════

/// CLI Configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CliConfig {
    /// Directory holding the persisted ledger
    pub data_dir: PathBuf,
    /// On-disk encoding of the ledger
    pub storage_format: StorageFormat,
    /// Default tracing directive
    pub log_level: String,
    /// Price applied when a command needs one and none is stored
    pub default_price: Option<u64>,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_format: StorageFormat::Json,
            log_level: "info".into(),
            default_price: None,
        }
    }
}

impl CliConfig {
    /// Load from file
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io(e.to_string()))?;

        serde_json::from_str(&content).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    /// Load from file when it exists, defaults otherwise
    pub fn load_or_default(path: &Path) -> Result<Self, ConfigError> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Save to file
    pub fn save(&self, path: &Path) -> Result<(), ConfigError> {
        let content =
            serde_json::to_string_pretty(self).map_err(|e| ConfigError::Serialize(e.to_string()))?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Io(e.to_string()))?;
        }

        std::fs::write(path, content).map_err(|e| ConfigError::Io(e.to_string()))
    }

    /// Load from environment variables
    pub fn from_env() -> Self {
        Self::default().with_env()
    }

    /// Override fields from `CDP_LEDGER_*` environment variables
    pub fn with_env(mut self) -> Self {
        if let Ok(dir) = std::env::var("CDP_LEDGER_DATA_DIR") {
            self.data_dir = PathBuf::from(dir);
        }

        if let Ok(format) = std::env::var("CDP_LEDGER_FORMAT") {
            if let Ok(format) = format.parse() {
                self.storage_format = format;
            }
        }

        if let Ok(level) = std::env::var("CDP_LEDGER_LOG") {
            self.log_level = level;
        }

        if let Ok(price) = std::env::var("CDP_LEDGER_PRICE") {
            if let Ok(price) = price.parse() {
                self.default_price = Some(price);
            }
        }

        self
    }

    /// Get default config file path
    pub fn default_path() -> PathBuf {
        default_data_dir().join("config.json")
    }

    /// Config file inside a data directory
    pub fn path_in(data_dir: &Path) -> PathBuf {
        data_dir.join("config.json")
    }

    /// Validate configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.data_dir.as_os_str().is_empty() {
            return Err(ConfigError::Validation("Data directory cannot be empty".into()));
        }

        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Validation("Log level cannot be empty".into()));
        }

        if self.default_price == Some(0) {
            return Err(ConfigError::Validation("Default price must be greater than 0".into()));
        }

        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// STORAGE FORMAT
// ═══════════════════════════════════════════════════════════════════════════════

/// On-disk ledger encoding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    /// Hex-keyed JSON index
    #[default]
    Json,
    /// bincode snapshot
    Binary,
}

impl StorageFormat {
    /// Get format name
    pub fn name(&self) -> &'static str {
        match self {
            StorageFormat::Json => "json",
            StorageFormat::Binary => "binary",
        }
    }
}

impl std::str::FromStr for StorageFormat {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "json" => Ok(StorageFormat::Json),
            "binary" | "bin" | "bincode" => Ok(StorageFormat::Binary),
            _ => Err(ConfigError::Validation(format!("Unknown storage format: {}", s))),
        }
    }
}

impl std::fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CONFIG ERROR
// ═══════════════════════════════════════════════════════════════════════════════

/// Configuration error
#[derive(Debug, Clone)]
pub enum ConfigError {
    /// IO error
    Io(String),
    /// Parse error
    Parse(String),
    /// Serialization error
    Serialize(String),
    /// Validation error
    Validation(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::Io(msg) => write!(f, "IO error: {}", msg),
            ConfigError::Parse(msg) => write!(f, "Parse error: {}", msg),
            ConfigError::Serialize(msg) => write!(f, "Serialization error: {}", msg),
            ConfigError::Validation(msg) => write!(f, "Validation error: {}", msg),
        }
    }
}

impl std::error::Error for ConfigError {}

// ═══════════════════════════════════════════════════════════════════════════════
// HELPER FUNCTIONS
// ═══════════════════════════════════════════════════════════════════════════════

/// Get default data directory
pub fn default_data_dir() -> PathBuf {
    if let Ok(home) = std::env::var("HOME") {
        return PathBuf::from(home).join(".cdp-ledger");
    }

    PathBuf::from(".cdp-ledger")
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════
