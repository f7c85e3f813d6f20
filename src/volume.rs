use anyhow::Result;
use log::warn;

use crate::bitmap::Bitmap;
use crate::error::ImageError;
use crate::progress::SharedProgress;

/// Maximum length of a filesystem tag; stored on disk as 16 null-padded bytes.
pub const FS_TAG_MAX: usize = 15;

/// Geometry and occupancy of the volume being imaged.
///
/// Produced by a [`VolumeSource`] driver on clone, or parsed from the
/// container header on restore.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeInfo {
    /// Filesystem type tag, e.g. "EXT4", "NTFS", "RAW".
    pub fs_tag: String,
    /// Block size in bytes (the filesystem's allocation unit).
    pub block_size: u32,
    /// Total number of blocks on the volume.
    pub total_blocks: u64,
    /// Number of used (in-use) blocks.
    pub used_blocks: u64,
    /// Volume size in bytes; must equal `total_blocks * block_size`.
    pub device_size: u64,
}

impl VolumeInfo {
    /// The device size implied by the block geometry, with overflow checking.
    pub fn expected_device_size(&self) -> Result<u64, ImageError> {
        self.total_blocks
            .checked_mul(self.block_size as u64)
            .ok_or(ImageError::SizeOverflow("total_blocks * block_size"))
    }

    /// Used data size in bytes, with overflow checking.
    pub fn used_size(&self) -> Result<u64, ImageError> {
        self.used_blocks
            .checked_mul(self.block_size as u64)
            .ok_or(ImageError::SizeOverflow("used_blocks * block_size"))
    }

    /// Enforce `device_size == total_blocks * block_size`, correcting drift.
    ///
    /// Returns true if the size was corrected. Drift indicates a sloppy
    /// driver or header, not a fatal condition; the block geometry is
    /// authoritative.
    pub fn normalize(&mut self) -> Result<bool, ImageError> {
        let expected = self.expected_device_size()?;
        if self.device_size != expected {
            warn!(
                "volume {} declares device size {} but geometry gives {}; correcting",
                self.fs_tag, self.device_size, expected
            );
            self.device_size = expected;
            return Ok(true);
        }
        Ok(false)
    }

    /// Validate invariants a foreign or corrupt header could break.
    pub fn validate(&self) -> Result<(), ImageError> {
        if self.block_size == 0 {
            return Err(ImageError::InvalidVolume("block size is zero".into()));
        }
        if self.used_blocks > self.total_blocks {
            return Err(ImageError::InvalidVolume(format!(
                "used blocks {} exceed total blocks {}",
                self.used_blocks, self.total_blocks
            )));
        }
        if self.fs_tag.len() > FS_TAG_MAX {
            return Err(ImageError::InvalidVolume(format!(
                "filesystem tag {:?} longer than {FS_TAG_MAX} bytes",
                self.fs_tag
            )));
        }
        Ok(())
    }
}

/// Capability boundary to the per-filesystem drivers.
///
/// The engines depend on nothing else about a filesystem: a driver scans
/// the superblock into a [`VolumeInfo`] and fills a caller-allocated
/// [`Bitmap`]. Drivers live outside this crate (one per supported
/// filesystem, selected at runtime); tests use a synthetic in-memory one.
pub trait VolumeSource: Send {
    /// Read and validate the superblock.
    ///
    /// Fails with a driver-specific error if the device cannot be opened or
    /// the filesystem is invalid or dirty (unless the driver's own
    /// ignore-check flag is set).
    fn scan_volume(&mut self) -> Result<VolumeInfo>;

    /// Fill `bitmap` with the used/free state of every block.
    ///
    /// `bitmap` is sized by the caller from [`VolumeInfo::total_blocks`].
    /// The driver may report scan progress through `progress`.
    fn build_bitmap(
        &mut self,
        info: &VolumeInfo,
        bitmap: &mut Bitmap,
        progress: &SharedProgress,
    ) -> Result<()>;
}
