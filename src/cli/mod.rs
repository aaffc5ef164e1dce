//! cdp-ledger Command Line Interface.
//!
//! Support code for the `cdp-ledger` binary: configuration, output
//! rendering, scenario replay and the on-disk ledger it drives.

pub mod config;
pub mod output;
pub mod scenario;

pub use config::*;
pub use output::*;
pub use scenario::*;

use crate::core::config::ProtocolParams;
use crate::error::Result;
use crate::protocol::state_machine::Protocol;
use crate::storage::backend::{BinaryStore, FileStore, StorageBackend, StorageKey, StorageValue};

// ═══════════════════════════════════════════════════════════════════════════════
// STORE SELECTION
// ═══════════════════════════════════════════════════════════════════════════════

/// Storage backend chosen at runtime from [`StorageFormat`]
#[derive(Debug)]
pub enum AnyStore {
    /// JSON snapshot file
    Json(FileStore),
    /// bincode snapshot file
    Binary(BinaryStore),
}

impl AnyStore {
    /// Open the store for a data directory
    pub fn open(config: &CliConfig) -> Result<Self> {
        Ok(match config.storage_format {
            StorageFormat::Json => AnyStore::Json(FileStore::new(&config.data_dir)?),
            StorageFormat::Binary => AnyStore::Binary(BinaryStore::new(&config.data_dir)?),
        })
    }

    fn inner(&self) -> &dyn StorageBackend {
        match self {
            AnyStore::Json(store) => store,
            AnyStore::Binary(store) => store,
        }
    }
}

impl StorageBackend for AnyStore {
    fn get(&self, key: &[u8]) -> Result<Option<StorageValue>> {
        self.inner().get(key)
    }

    fn set(&self, key: &[u8], value: &[u8]) -> Result<()> {
        self.inner().set(key, value)
    }

    fn set_batch(&self, entries: &[(StorageKey, StorageValue)]) -> Result<()> {
        self.inner().set_batch(entries)
    }

    fn delete(&self, key: &[u8]) -> Result<bool> {
        self.inner().delete(key)
    }

    fn exists(&self, key: &[u8]) -> Result<bool> {
        self.inner().exists(key)
    }

    fn list_prefix(&self, prefix: &[u8]) -> Result<Vec<StorageKey>> {
        self.inner().list_prefix(prefix)
    }

    fn flush(&self) -> Result<()> {
        self.inner().flush()
    }

    fn keys(&self) -> Result<Vec<StorageKey>> {
        self.inner().keys()
    }

    fn clear(&self) -> Result<()> {
        self.inner().clear()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CLI APPLICATION
// ═══════════════════════════════════════════════════════════════════════════════

/// CLI Application state
#[derive(Debug, Clone)]
pub struct CliApp {
    /// Configuration
    config: CliConfig,
    /// Output formatter
    output: OutputFormatter,
}

impl CliApp {
    /// Create new CLI application
    pub fn new(config: CliConfig) -> Self {
        Self {
            config,
            output: OutputFormatter::default(),
        }
    }

    /// Set output format
    pub fn with_format(mut self, format: OutputFormat) -> Self {
        self.output = OutputFormatter::new(format);
        self
    }

    /// Get configuration
    pub fn config(&self) -> &CliConfig {
        &self.config
    }

    /// Get output formatter
    pub fn output(&self) -> &OutputFormatter {
        &self.output
    }

    /// Create a fresh ledger in the data directory
    pub fn create_protocol(&self, params: ProtocolParams) -> Result<Protocol<AnyStore>> {
        Protocol::create(AnyStore::open(&self.config)?, params)
    }

    /// Open the ledger in the data directory
    ///
    /// Applies the configured default price when the ledger has none.
    pub fn open_protocol(&self) -> Result<Protocol<AnyStore>> {
        let mut protocol = Protocol::open(AnyStore::open(&self.config)?)?;
        if protocol.price().is_none() {
            if let Some(price) = self.config.default_price {
                protocol.set_price(price)?;
            }
        }
        Ok(protocol)
    }

    /// Open the ledger, creating it with `params` when absent
    pub fn open_or_create_protocol(&self, params: ProtocolParams) -> Result<Protocol<AnyStore>> {
        let mut protocol = Protocol::open_or_create(AnyStore::open(&self.config)?, params)?;
        if protocol.price().is_none() {
            if let Some(price) = self.config.default_price {
                protocol.set_price(price)?;
            }
        }
        Ok(protocol)
    }
}

impl Default for CliApp {
    fn default() -> Self {
        Self::new(CliConfig::default())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::TokenAmount;
    use crate::error::Error;
    use crate::utils::hash::AccountId;

    fn app_in(dir: &std::path::Path, format: StorageFormat) -> CliApp {
        CliApp::new(CliConfig {
            data_dir: dir.to_path_buf(),
            storage_format: format,
            ..CliConfig::default()
        })
    }

    #[test]
    fn test_open_requires_init() {
        let dir = tempfile::tempdir().unwrap();
        let app = app_in(dir.path(), StorageFormat::Json);
        assert!(matches!(app.open_protocol(), Err(Error::StateNotFound(_))));
    }

    #[test]
    fn test_state_survives_reopen() {
        for format in [StorageFormat::Json, StorageFormat::Binary] {
            let dir = tempfile::tempdir().unwrap();
            let app = app_in(dir.path(), format);
            let alice = AccountId::from_name("alice");

            {
                let mut protocol = app.create_protocol(ProtocolParams::default()).unwrap();
                protocol.deposit(alice, TokenAmount::from_whole(250)).unwrap();
                protocol.save().unwrap();
            }

            let protocol = app.open_protocol().unwrap();
            assert_eq!(
                protocol.compounded_deposit(&alice).unwrap(),
                TokenAmount::from_whole(250)
            );
        }
    }

    #[test]
    fn test_default_price_applied() {
        let dir = tempfile::tempdir().unwrap();
        let mut app = app_in(dir.path(), StorageFormat::Binary);
        app.config.default_price = Some(1_000_000_000);

        let protocol = app.open_or_create_protocol(ProtocolParams::default()).unwrap();
        assert_eq!(protocol.price(), Some(1_000_000_000));
    }

    #[test]
    fn test_any_store_delegates() {
        let dir = tempfile::tempdir().unwrap();
        let store = AnyStore::open(&app_in(dir.path(), StorageFormat::Json).config).unwrap();

        store.set(b"k", b"v").unwrap();
        assert_eq!(store.get(b"k").unwrap(), Some(b"v".to_vec()));
        assert!(store.delete(b"k").unwrap());
        assert!(!store.exists(b"k").unwrap());
    }
}
