//! Ledger state management with persistence.
//!
//! The whole ledger is persisted as one snapshot: parameters, the
//! Stability Pool, the position book with its redistribution ledger,
//! the liquidation engine, recent events and a metadata record. Every
//! part is written in a single batch and the metadata carries hashes of
//! both ledgers, so a load can tell a torn or tampered snapshot from a
//! good one.

use serde::{Deserialize, Serialize};

use crate::core::config::ProtocolParams;
use crate::core::position::PositionManager;
use crate::error::{Error, Result};
use crate::liquidation::engine::LiquidationEngine;
use crate::liquidation::stability_pool::StabilityPool;
use crate::protocol::events::EventLog;
use crate::storage::backend::{encode, make_key, prefixes, StorageBackend, TypedStore};
use crate::utils::hash::Hash;

/// Snapshot layout version
pub const STATE_VERSION: u32 = 1;

const KEY_PARAMS: &[u8] = b"params";
const KEY_POOL: &[u8] = b"state";
const KEY_POSITIONS: &[u8] = b"book";
const KEY_ENGINE: &[u8] = b"engine";
const KEY_EVENTS: &[u8] = b"log";
const KEY_META: &[u8] = b"snapshot";

// ═══════════════════════════════════════════════════════════════════════════════
// METADATA
// ═══════════════════════════════════════════════════════════════════════════════

/// Metadata written alongside every snapshot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerMeta {
    /// Snapshot layout version
    pub version: u32,
    /// Last block height applied
    pub block_height: u64,
    /// Last collateral price set, if any
    pub price: Option<u64>,
    /// Stability pool state hash
    pub pool_hash: Hash,
    /// Redistribution ledger state hash
    pub ledger_hash: Hash,
    /// Events ever recorded
    pub events_recorded: u64,
}

impl LedgerMeta {
    /// Metadata describing a ledger view
    pub fn describe(snapshot: &SnapshotRef<'_>) -> Result<Self> {
        Ok(Self {
            version: STATE_VERSION,
            block_height: snapshot.block_height,
            price: snapshot.price,
            pool_hash: snapshot.pool.state_hash()?,
            ledger_hash: snapshot.positions.ledger().state_hash()?,
            events_recorded: snapshot.events.total_recorded(),
        })
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// SNAPSHOT
// ═══════════════════════════════════════════════════════════════════════════════

/// Complete ledger snapshot
#[derive(Debug, Clone)]
pub struct LedgerSnapshot {
    /// Protocol parameters
    pub params: ProtocolParams,
    /// Stability pool
    pub pool: StabilityPool,
    /// Position book and redistribution ledger
    pub positions: PositionManager,
    /// Liquidation engine
    pub engine: LiquidationEngine,
    /// Retained events
    pub events: EventLog,
    /// Snapshot metadata
    pub meta: LedgerMeta,
}

/// Borrowed view of the ledger for saving without cloning
#[derive(Debug, Clone, Copy)]
pub struct SnapshotRef<'a> {
    /// Protocol parameters
    pub params: &'a ProtocolParams,
    /// Stability pool
    pub pool: &'a StabilityPool,
    /// Position book and redistribution ledger
    pub positions: &'a PositionManager,
    /// Liquidation engine
    pub engine: &'a LiquidationEngine,
    /// Retained events
    pub events: &'a EventLog,
    /// Last block height applied
    pub block_height: u64,
    /// Last collateral price set, if any
    pub price: Option<u64>,
}

// ═══════════════════════════════════════════════════════════════════════════════
// STATE MANAGER
// ═══════════════════════════════════════════════════════════════════════════════

/// High-level persistence of the ledger
pub struct StateManager<B: StorageBackend> {
    store: TypedStore<B>,
}

impl<B: StorageBackend> StateManager<B> {
    /// Create a new state manager
    pub fn new(backend: B) -> Self {
        Self {
            store: TypedStore::new(backend),
        }
    }

    /// Whether a snapshot has been saved
    pub fn has_state(&self) -> Result<bool> {
        self.store.exists(&make_key(prefixes::META, KEY_META))
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // SNAPSHOT OPERATIONS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Write every part of the ledger in one batch and flush
    pub fn save_snapshot(&self, snapshot: SnapshotRef<'_>) -> Result<LedgerMeta> {
        let meta = LedgerMeta::describe(&snapshot)?;

        let batch = vec![
            (make_key(prefixes::PARAMS, KEY_PARAMS), encode(snapshot.params)?),
            (make_key(prefixes::POOL, KEY_POOL), encode(snapshot.pool)?),
            (make_key(prefixes::POSITIONS, KEY_POSITIONS), encode(snapshot.positions)?),
            (make_key(prefixes::ENGINE, KEY_ENGINE), encode(snapshot.engine)?),
            (make_key(prefixes::EVENTS, KEY_EVENTS), encode(snapshot.events)?),
            (make_key(prefixes::META, KEY_META), encode(&meta)?),
        ];
        self.store.set_batch(&batch)?;
        self.store.flush()?;

        tracing::info!(
            block_height = meta.block_height,
            pool_hash = %meta.pool_hash,
            ledger_hash = %meta.ledger_hash,
            "ledger snapshot saved"
        );
        Ok(meta)
    }

    /// Load the saved snapshot, if any
    ///
    /// Fails when a part is missing, the layout version is unknown or a
    /// ledger no longer matches the hash recorded with it.
    pub fn load_snapshot(&self) -> Result<Option<LedgerSnapshot>> {
        let meta: LedgerMeta = match self.store.get(&make_key(prefixes::META, KEY_META))? {
            Some(meta) => meta,
            None => return Ok(None),
        };
        if meta.version != STATE_VERSION {
            return Err(Error::Storage(format!(
                "unsupported snapshot version {} (expected {})",
                meta.version, STATE_VERSION
            )));
        }

        let snapshot = LedgerSnapshot {
            params: self.require(prefixes::PARAMS, KEY_PARAMS)?,
            pool: self.require(prefixes::POOL, KEY_POOL)?,
            positions: self.require(prefixes::POSITIONS, KEY_POSITIONS)?,
            engine: self.require(prefixes::ENGINE, KEY_ENGINE)?,
            events: self.require(prefixes::EVENTS, KEY_EVENTS)?,
            meta,
        };
        Self::verify(&snapshot)?;

        tracing::debug!(block_height = snapshot.meta.block_height, "ledger snapshot loaded");
        Ok(Some(snapshot))
    }

    /// Load only the metadata record
    pub fn load_meta(&self) -> Result<Option<LedgerMeta>> {
        self.store.get(&make_key(prefixes::META, KEY_META))
    }

    /// Load only the protocol parameters
    pub fn load_params(&self) -> Result<Option<ProtocolParams>> {
        self.store.get(&make_key(prefixes::PARAMS, KEY_PARAMS))
    }

    fn require<T: serde::de::DeserializeOwned>(&self, prefix: &[u8], key: &[u8]) -> Result<T> {
        let full = make_key(prefix, key);
        self.store
            .get(&full)?
            .ok_or_else(|| Error::StateNotFound(String::from_utf8_lossy(&full).into_owned()))
    }

    fn verify(snapshot: &LedgerSnapshot) -> Result<()> {
        let pool_hash = snapshot.pool.state_hash()?;
        if pool_hash != snapshot.meta.pool_hash {
            return Err(Error::Storage(format!(
                "stability pool hash mismatch: stored {}, computed {}",
                snapshot.meta.pool_hash, pool_hash
            )));
        }
        let ledger_hash = snapshot.positions.ledger().state_hash()?;
        if ledger_hash != snapshot.meta.ledger_hash {
            return Err(Error::Storage(format!(
                "redistribution ledger hash mismatch: stored {}, computed {}",
                snapshot.meta.ledger_hash, ledger_hash
            )));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════════════════════
    // UTILITY METHODS
    // ═══════════════════════════════════════════════════════════════════════════

    /// Flush all pending writes
    pub fn flush(&self) -> Result<()> {
        self.store.flush()
    }

    /// Clear all data
    pub fn clear(&self) -> Result<()> {
        self.store.clear()?;
        self.store.flush()
    }

    /// Get the underlying backend
    pub fn backend(&self) -> &B {
        self.store.backend()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// TESTS
// ═══════════════════════════════════════════════════════════════════════════════

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::amount::{CollateralAmount, TokenAmount};
    use crate::storage::backend::{FileStore, InMemoryStore};
    use crate::utils::constants::STABLE_BASE_UNIT;
    use crate::utils::hash::AccountId;

    struct Parts {
        params: ProtocolParams,
        pool: StabilityPool,
        positions: PositionManager,
        engine: LiquidationEngine,
        events: EventLog,
    }

    impl Parts {
        fn populated() -> Self {
            let params = ProtocolParams::default();
            let mut pool = StabilityPool::new();
            pool.deposit(AccountId::from_name("alice"), TokenAmount::from_whole(1_000), 1)
                .unwrap();
            pool.offset(TokenAmount::from_whole(250), CollateralAmount::from_whole(1))
                .unwrap();

            let mut positions = PositionManager::new(&params);
            positions
                .open(
                    AccountId::from_name("bob"),
                    CollateralAmount::from_whole(1),
                    TokenAmount::from_whole(500),
                    2_000 * STABLE_BASE_UNIT,
                    2,
                )
                .unwrap();

            Self {
                params,
                pool,
                positions,
                engine: LiquidationEngine::new(),
                events: EventLog::new(16),
            }
        }

        fn view(&self, block_height: u64) -> SnapshotRef<'_> {
            SnapshotRef {
                params: &self.params,
                pool: &self.pool,
                positions: &self.positions,
                engine: &self.engine,
                events: &self.events,
                block_height,
                price: Some(2_000 * STABLE_BASE_UNIT),
            }
        }
    }

    #[test]
    fn test_empty_store_has_no_snapshot() {
        let manager = StateManager::new(InMemoryStore::new());
        assert!(!manager.has_state().unwrap());
        assert!(manager.load_snapshot().unwrap().is_none());
    }

    #[test]
    fn test_snapshot_roundtrip() {
        let manager = StateManager::new(InMemoryStore::new());
        let parts = Parts::populated();

        let meta = manager.save_snapshot(parts.view(42)).unwrap();
        assert_eq!(meta.block_height, 42);
        assert_eq!(meta.price, Some(2_000 * STABLE_BASE_UNIT));
        assert!(manager.has_state().unwrap());

        let loaded = manager.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.meta, meta);
        assert_eq!(loaded.params, parts.params);
        assert_eq!(loaded.pool.state(), parts.pool.state());
        assert_eq!(
            loaded.pool.get_compounded_deposit(&AccountId::from_name("alice")).unwrap(),
            parts.pool.get_compounded_deposit(&AccountId::from_name("alice")).unwrap()
        );
        assert_eq!(loaded.positions.active_count(), 1);
    }

    #[test]
    fn test_missing_part_is_reported() {
        let manager = StateManager::new(InMemoryStore::new());
        let parts = Parts::populated();
        manager.save_snapshot(parts.view(1)).unwrap();

        manager
            .backend()
            .delete(&make_key(prefixes::ENGINE, KEY_ENGINE))
            .unwrap();
        assert!(matches!(
            manager.load_snapshot(),
            Err(Error::StateNotFound(_))
        ));
    }

    #[test]
    fn test_tampered_pool_is_rejected() {
        let manager = StateManager::new(InMemoryStore::new());
        let parts = Parts::populated();
        manager.save_snapshot(parts.view(1)).unwrap();

        // Swap in a pool that never saw the offset
        let mut other = StabilityPool::new();
        other
            .deposit(AccountId::from_name("alice"), TokenAmount::from_whole(1_000), 1)
            .unwrap();
        manager
            .backend()
            .set(&make_key(prefixes::POOL, KEY_POOL), &other.to_bytes().unwrap())
            .unwrap();

        assert!(matches!(manager.load_snapshot(), Err(Error::Storage(_))));
    }

    #[test]
    fn test_snapshot_survives_reopen() {
        let temp_dir = tempfile::tempdir().unwrap();
        let parts = Parts::populated();
        {
            let manager = StateManager::new(FileStore::new(temp_dir.path()).unwrap());
            manager.save_snapshot(parts.view(9)).unwrap();
        }

        let manager = StateManager::new(FileStore::new(temp_dir.path()).unwrap());
        let loaded = manager.load_snapshot().unwrap().unwrap();
        assert_eq!(loaded.meta.block_height, 9);
        assert_eq!(loaded.pool.total_deposits(), parts.pool.total_deposits());
        assert_eq!(manager.load_params().unwrap(), Some(parts.params));
    }

    #[test]
    fn test_clear_removes_snapshot() {
        let manager = StateManager::new(InMemoryStore::new());
        manager.save_snapshot(Parts::populated().view(1)).unwrap();
        manager.clear().unwrap();
        assert!(manager.load_meta().unwrap().is_none());
    }
}
