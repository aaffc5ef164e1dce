//! Hashes and 32-byte identifiers.
//!
//! Depositors and position owners are identified by an [`AccountId`],
//! positions by a [`PositionId`] derived from the owner and a nonce, and
//! ledger state is fingerprinted with a SHA-256 [`Hash`].

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;

use crate::error::{Error, Result};

/// Byte length of every hash and identifier
pub const ID_LENGTH: usize = 32;

fn sha256(parts: &[&[u8]]) -> [u8; ID_LENGTH] {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    let mut bytes = [0u8; ID_LENGTH];
    bytes.copy_from_slice(&hasher.finalize());
    bytes
}

/// Defines a 32-byte identifier serialized as a hex string
macro_rules! hex_id {
    ($(#[$meta:meta])* $name:ident, $label:literal) => {
        $(#[$meta])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
        pub struct $name([u8; ID_LENGTH]);

        impl $name {
            /// Wrap raw bytes
            pub const fn new(bytes: [u8; ID_LENGTH]) -> Self {
                Self(bytes)
            }

            /// Parse from a slice of exactly 32 bytes
            pub fn from_slice(slice: &[u8]) -> Result<Self> {
                if slice.len() != ID_LENGTH {
                    return Err(Error::InvalidParameter {
                        name: $label.into(),
                        reason: format!("expected {} bytes, got {}", ID_LENGTH, slice.len()),
                    });
                }
                let mut bytes = [0u8; ID_LENGTH];
                bytes.copy_from_slice(slice);
                Ok(Self(bytes))
            }

            /// Parse from a hex string
            pub fn from_hex(s: &str) -> Result<Self> {
                let bytes = hex::decode(s).map_err(|e| Error::InvalidParameter {
                    name: $label.into(),
                    reason: e.to_string(),
                })?;
                Self::from_slice(&bytes)
            }

            /// Raw bytes
            pub fn as_bytes(&self) -> &[u8; ID_LENGTH] {
                &self.0
            }

            /// Hex encoding
            pub fn to_hex(&self) -> String {
                hex::encode(self.0)
            }
        }

        impl Serialize for $name {
            fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
            where
                S: Serializer,
            {
                serializer.serialize_str(&self.to_hex())
            }
        }

        impl<'de> Deserialize<'de> for $name {
            fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
            where
                D: Deserializer<'de>,
            {
                let s = String::deserialize(deserializer)?;
                Self::from_hex(&s).map_err(serde::de::Error::custom)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}({})", stringify!($name), &self.to_hex()[..16])
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.to_hex())
            }
        }

        impl AsRef<[u8]> for $name {
            fn as_ref(&self) -> &[u8] {
                &self.0
            }
        }
    };
}

// ═══════════════════════════════════════════════════════════════════════════════
// HASH
// ═══════════════════════════════════════════════════════════════════════════════

hex_id!(
    /// A 32-byte SHA-256 digest
    Hash,
    "hash"
);

impl Hash {
    /// Compute SHA256 hash of data
    pub fn sha256(data: &[u8]) -> Self {
        Self(sha256(&[data]))
    }

    /// Zero hash (all zeros)
    pub fn zero() -> Self {
        Self([0u8; ID_LENGTH])
    }

    /// Check if this is the zero hash
    pub fn is_zero(&self) -> bool {
        self.0 == [0u8; ID_LENGTH]
    }

    /// Hash of two hashes concatenated
    pub fn combine(left: &Hash, right: &Hash) -> Self {
        Self(sha256(&[&left.0, &right.0]))
    }
}

/// Merkle root over `hashes`
///
/// An odd node at any level is paired with itself. The root of an empty
/// list is the zero hash.
pub fn merkle_root(hashes: &[Hash]) -> Hash {
    if hashes.is_empty() {
        return Hash::zero();
    }

    let mut level = hashes.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => Hash::combine(left, right),
                [single] => Hash::combine(single, single),
                _ => Hash::zero(),
            })
            .collect();
    }
    level[0]
}

impl Default for Hash {
    fn default() -> Self {
        Self::zero()
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ACCOUNT ID
// ═══════════════════════════════════════════════════════════════════════════════

hex_id!(
    /// Identity of a depositor or position owner
    AccountId,
    "account"
);

impl AccountId {
    /// Derive an account id from a human-readable name
    pub fn from_name(name: &str) -> Self {
        Self(sha256(&[b"account:", name.as_bytes()]))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// POSITION ID
// ═══════════════════════════════════════════════════════════════════════════════

hex_id!(
    /// Unique identifier of a position
    PositionId,
    "position"
);

impl PositionId {
    /// Generate a position id from owner and nonce
    pub fn generate(owner: &AccountId, nonce: u64) -> Self {
        Self(sha256(&[b"position:", owner.as_bytes(), &nonce.to_le_bytes()]))
    }
}
