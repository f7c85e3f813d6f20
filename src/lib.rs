//! Sparse block-level partition imaging.
//!
//! Copies only the blocks a filesystem reports as in use into a portable,
//! checksummed container, and restores that container back onto a raw
//! block device or plain image file. Filesystem knowledge lives behind the
//! [`volume::VolumeSource`] trait; everything here is
//! filesystem-agnostic: the used-block [`bitmap`], the [`checksum`]
//! subsystem with its chained running digests, the [`image`] container
//! codec, the [`clone`] and [`restore`] engines, and the polled
//! [`progress`] monitor.

pub mod bitmap;
pub mod checksum;
pub mod clone;
pub mod error;
pub mod image;
pub mod progress;
pub mod restore;
pub mod summary;
pub mod volume;

pub use bitmap::Bitmap;
pub use checksum::{Checksum, ChecksumMode};
pub use clone::{run_clone, CloneConfig, CloneReport, ImageCompression};
pub use error::ImageError;
pub use image::{ChecksumOptions, ImageHeader, ImageVersion};
pub use progress::{new_shared, spawn_monitor, ProgressSnapshot, SharedProgress, Stage};
pub use restore::{run_restore, RestoreConfig, RestoreReport};
pub use summary::{read_summary, write_summary_json, ImageSummary};
pub use volume::{VolumeInfo, VolumeSource};
