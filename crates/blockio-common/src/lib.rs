//! Shared foundation for the blockio storage engine
//!
//! This crate holds the types every other blockio crate agrees on:
//! - Object identifiers and version ordering keys
//! - The common error type with errno-style retval mapping
//! - CRC32C checksum helpers (including zero-padded variants)
//! - Little-endian bitmap helpers

pub mod bitmap;
pub mod checksum;
pub mod error;
pub mod types;

// Re-exports
pub use checksum::{compute_crc32c, crc32c_nopad, crc32c_pad, verify_crc32c};
pub use error::{Error, Result};
pub use types::{Oid, ObjVer, PoolId, EPOCH_BITS, POOL_ID_BITS};
