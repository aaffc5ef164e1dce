//! Storage module for persistent ledger snapshots.
//!
//! ## Backends
//!
//! - **InMemoryStore**: Fast, ephemeral storage for testing
//! - **FileStore**: JSON file-based persistence, easy to inspect
//! - **BinaryStore**: Compact bincode file
//!
//! ## Usage
//!
//! ```rust,ignore
//! use cdp_ledger::storage::{FileStore, StateManager};
//!
//! let manager = StateManager::new(FileStore::new("./ledger-data")?);
//! if let Some(snapshot) = manager.load_snapshot()? {
//!     println!("resuming at block {}", snapshot.meta.block_height);
//! }
//! ```

pub mod backend;
pub mod state;

pub use backend::*;
pub use state::*;
