//! Engine configuration
//!
//! Layout-critical options (block sizes, journal geometry, checksum
//! settings) must match the on-disk superblock and are verified at open.
//! The rest tune runtime behavior: commit mode, autosync cadence,
//! in-memory mirrors, iodepth and small-write throttling.

use blockio_common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// When a write is considered committed without an explicit SYNC
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImmediateCommit {
    /// Nothing is durable until SYNC
    #[default]
    None,
    /// Small (journaled) writes are fsynced inline
    Small,
    /// Every write is fsynced inline
    All,
}

/// Per-sub-block data checksum algorithm
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CsumType {
    /// Data checksums disabled
    #[default]
    None,
    Crc32c,
}

/// Small-write pacing parameters
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ThrottleConfig {
    /// Enable pacing of journaled writes
    pub enabled: bool,
    /// Target sustained IOPS of the backing journal device
    pub target_iops: u64,
    /// Target sustained bandwidth in MB/s
    pub target_mbs: u64,
    /// Parallelism the targets are calibrated for
    pub target_parallelism: u64,
    /// Do not delay completions by less than this
    pub threshold_us: u64,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            target_iops: 100,
            target_mbs: 100,
            target_parallelism: 1,
            threshold_us: 50,
        }
    }
}

/// Engine configuration
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    /// Data device path
    pub data_path: PathBuf,
    /// Metadata device path
    pub meta_path: PathBuf,
    /// Journal device path
    pub journal_path: PathBuf,

    /// Byte offset of the data area on the data device
    pub data_offset: u64,
    /// Byte offset of the metadata area (superblock) on the meta device
    pub meta_offset: u64,
    /// Byte offset of the journal ring on the journal device
    pub journal_offset: u64,
    /// Journal ring length in bytes (0 = rest of the device)
    pub journal_len: u64,

    /// Data block size; power of two
    pub data_block_size: u32,
    /// Presence bitmap granularity; power of two
    pub bitmap_granularity: u32,
    /// Metadata block size
    pub meta_block_size: u32,
    /// Journal sector size
    pub journal_block_size: u32,
    /// Data checksum algorithm
    pub data_csum_type: CsumType,
    /// Per-sub-block checksum granularity; 0 disables data checksums
    pub csum_block_size: u32,

    /// Commit mode
    pub immediate_commit: ImmediateCommit,
    /// Force a sync after this many unsynced writes (0 = off)
    pub autosync_writes: u64,
    /// Force a sync on this cadence when unsynced writes exist
    pub autosync_interval: Duration,

    /// Keep the whole metadata area mirrored in memory
    pub inmemory_meta: bool,
    /// Keep the journal ring mirrored in memory
    pub inmemory_journal: bool,

    /// Cap on concurrently submitted writes
    pub max_write_iodepth: u32,

    /// Open devices with direct I/O
    pub direct_io: bool,
    /// Open the store read-only
    pub read_only: bool,
    /// Skip data device fsyncs (power-loss-protected devices)
    pub disable_data_fsync: bool,
    /// Skip journal/meta device fsyncs (power-loss-protected devices)
    pub disable_journal_fsync: bool,

    /// Small-write pacing
    pub throttle: ThrottleConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_path: PathBuf::from("/var/lib/blockio/data"),
            meta_path: PathBuf::from("/var/lib/blockio/meta"),
            journal_path: PathBuf::from("/var/lib/blockio/journal"),
            data_offset: 0,
            meta_offset: 0,
            journal_offset: 0,
            journal_len: 0,
            data_block_size: 128 * 1024,
            bitmap_granularity: 4096,
            meta_block_size: 4096,
            journal_block_size: 4096,
            data_csum_type: CsumType::None,
            csum_block_size: 0,
            immediate_commit: ImmediateCommit::None,
            autosync_writes: 128,
            autosync_interval: Duration::from_secs(5),
            inmemory_meta: true,
            inmemory_journal: true,
            max_write_iodepth: 128,
            direct_io: true,
            read_only: false,
            disable_data_fsync: false,
            disable_journal_fsync: false,
            throttle: ThrottleConfig::default(),
        }
    }
}

impl Config {
    /// Validate option combinations that cannot work
    pub fn validate(&self) -> Result<()> {
        if !self.data_block_size.is_power_of_two() {
            return Err(Error::Configuration(
                "data_block_size must be a power of two".into(),
            ));
        }
        if !self.bitmap_granularity.is_power_of_two()
            || self.bitmap_granularity > self.data_block_size
        {
            return Err(Error::Configuration(
                "bitmap_granularity must be a power of two not larger than data_block_size".into(),
            ));
        }
        if self.data_block_size % self.bitmap_granularity != 0 {
            return Err(Error::Configuration(
                "data_block_size must be a multiple of bitmap_granularity".into(),
            ));
        }
        if !self.meta_block_size.is_power_of_two() || !self.journal_block_size.is_power_of_two() {
            return Err(Error::Configuration(
                "meta_block_size and journal_block_size must be powers of two".into(),
            ));
        }
        if (self.data_csum_type == CsumType::None) != (self.csum_block_size == 0) {
            return Err(Error::Configuration(
                "data_csum_type and csum_block_size must be enabled together".into(),
            ));
        }
        if self.csum_block_size != 0 {
            if !self.csum_block_size.is_power_of_two() {
                return Err(Error::Configuration(
                    "csum_block_size must be a power of two".into(),
                ));
            }
            if self.csum_block_size % self.bitmap_granularity != 0
                || self.data_block_size % self.csum_block_size != 0
            {
                return Err(Error::Configuration(
                    "csum_block_size must divide data_block_size and be a multiple of bitmap_granularity"
                        .into(),
                ));
            }
        }
        if self.max_write_iodepth == 0 {
            return Err(Error::Configuration(
                "max_write_iodepth must be at least 1".into(),
            ));
        }
        if self.throttle.enabled
            && (self.throttle.target_iops == 0
                || self.throttle.target_mbs == 0
                || self.throttle.target_parallelism == 0)
        {
            return Err(Error::Configuration(
                "throttle targets must be non-zero when throttling is enabled".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_rejects_bad_block_size() {
        let cfg = Config {
            data_block_size: 100_000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn test_rejects_bad_csum_block() {
        let cfg = Config {
            csum_block_size: 1000,
            ..Config::default()
        };
        assert!(cfg.validate().is_err());
    }
}
