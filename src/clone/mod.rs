pub mod rescue;
pub mod verify;

use std::fs::File;
use std::io::{self, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::bitmap::Bitmap;
use crate::checksum::{Checksum, ChecksumMode};
use crate::error::ImageError;
use crate::image::{self, ChecksumOptions};
use crate::progress::{self, LogLevel, SharedProgress, Stage};
use crate::volume::{VolumeInfo, VolumeSource};
use verify::SidecarChecksum;

const ZSTD_LEVEL: i32 = 3;

/// Whole-container compression choice.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageCompression {
    None,
    Zstd,
}

impl ImageCompression {
    pub fn as_str(&self) -> &'static str {
        match self {
            ImageCompression::None => "none",
            ImageCompression::Zstd => "zstd",
        }
    }
}

/// Configuration for a clone run.
#[derive(Debug, Clone)]
pub struct CloneConfig {
    pub checksum_mode: ChecksumMode,
    /// Used blocks per checksum tag. The format allows any value >= 1;
    /// one tag per block is the conventional setting.
    pub blocks_per_group: u32,
    pub compression: ImageCompression,
    /// Degrade unreadable source blocks to sector-granular rescue reads
    /// instead of aborting the run.
    pub rescue: bool,
    /// Write a whole-file checksum sidecar next to the finished image.
    pub sidecar: Option<SidecarChecksum>,
}

impl Default for CloneConfig {
    fn default() -> Self {
        Self {
            checksum_mode: ChecksumMode::Crc32,
            blocks_per_group: 1,
            compression: ImageCompression::None,
            rescue: false,
            sidecar: None,
        }
    }
}

impl CloneConfig {
    fn validate(&self) -> Result<()> {
        if self.blocks_per_group == 0 {
            bail!("blocks per checksum group must be at least 1");
        }
        if self.checksum_mode == ChecksumMode::Crc32Legacy {
            bail!("the legacy crc32 mode is for reading old images only; new images must not use it");
        }
        Ok(())
    }
}

/// Totals from a completed clone.
#[derive(Debug, Clone)]
pub struct CloneReport {
    pub volume: VolumeInfo,
    pub blocks_copied: u64,
    /// Sectors replaced with the rescue sentinel.
    pub bad_sectors: u64,
}

enum ImageWriter<W: Write> {
    Plain(W),
    Zstd(zstd::stream::write::Encoder<'static, W>),
}

impl<W: Write> Write for ImageWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            ImageWriter::Plain(w) => w.write(buf),
            ImageWriter::Zstd(e) => e.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            ImageWriter::Plain(w) => w.flush(),
            ImageWriter::Zstd(e) => e.flush(),
        }
    }
}

impl<W: Write> ImageWriter<W> {
    fn finish(self) -> io::Result<W> {
        match self {
            ImageWriter::Plain(w) => Ok(w),
            ImageWriter::Zstd(e) => e.finish(),
        }
    }
}

fn finalize_progress<T>(progress: &SharedProgress, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => progress::mark_finished(progress, None),
        Err(e) => progress::mark_finished(progress, Some(format!("{e:#}"))),
    }
    result
}

/// Clone `source` into an image file at `image_path`, then sync it and
/// write the optional checksum sidecar.
pub fn run_clone(
    source: &mut (impl Read + Seek),
    driver: &mut dyn VolumeSource,
    image_path: &Path,
    config: &CloneConfig,
    progress: &SharedProgress,
) -> Result<CloneReport> {
    let result = run_clone_inner(source, driver, image_path, config, progress);
    finalize_progress(progress, result)
}

fn run_clone_inner(
    source: &mut (impl Read + Seek),
    driver: &mut dyn VolumeSource,
    image_path: &Path,
    config: &CloneConfig,
    progress: &SharedProgress,
) -> Result<CloneReport> {
    let file = File::create(image_path)
        .with_context(|| format!("failed to create {}", image_path.display()))?;
    let mut writer = BufWriter::new(file);

    let report = clone_inner(source, driver, &mut writer, config, progress)?;

    writer.flush().context("failed to flush image file")?;
    writer
        .get_ref()
        .sync_all()
        .context("failed to sync image file")?;

    if let Some(kind) = config.sidecar {
        let checksum = verify::compute_checksum(image_path, kind)?;
        verify::write_checksum_file(&checksum, image_path, kind)?;
        progress::push_log(
            progress,
            LogLevel::Info,
            format!("Wrote {} sidecar: {checksum}", kind.as_str()),
        );
    }

    Ok(report)
}

/// Clone `source` into `writer`. Core entry point for callers that manage
/// their own output (tests, pipes); [`run_clone`] is the file-path wrapper.
pub fn clone_image<W: Write>(
    source: &mut (impl Read + Seek),
    driver: &mut dyn VolumeSource,
    writer: W,
    config: &CloneConfig,
    progress: &SharedProgress,
) -> Result<CloneReport> {
    let result = clone_inner(source, driver, writer, config, progress);
    finalize_progress(progress, result)
}

fn clone_inner<W: Write>(
    source: &mut (impl Read + Seek),
    driver: &mut dyn VolumeSource,
    writer: W,
    config: &CloneConfig,
    progress: &SharedProgress,
) -> Result<CloneReport> {
    config.validate()?;

    // Scan the superblock via the filesystem driver.
    progress::set_stage(progress, Stage::ScanningVolume);
    progress::push_log(progress, LogLevel::Info, "Scanning volume...");
    let mut volume = driver.scan_volume().context("volume scan failed")?;
    if volume.normalize()? {
        progress::push_log(
            progress,
            LogLevel::Warning,
            format!("Corrected declared device size to {}", volume.device_size),
        );
    }
    volume.validate()?;
    info!(
        "volume: {} blocks of {} bytes, {} used ({})",
        volume.total_blocks, volume.block_size, volume.used_blocks, volume.fs_tag
    );

    if progress::is_cancelled(progress) {
        bail!("clone cancelled");
    }

    // Let the driver fill the used-block bitmap.
    progress::set_stage(progress, Stage::BuildingBitmap);
    progress::push_log(progress, LogLevel::Info, "Building used-block bitmap...");
    progress::set_total_blocks(progress, volume.total_blocks);
    let mut bitmap = Bitmap::new(volume.total_blocks)?;
    driver
        .build_bitmap(&volume, &mut bitmap, progress)
        .context("bitmap build failed")?;

    // The bitmap is authoritative over the superblock's used count.
    let counted = bitmap.count_used();
    if counted != volume.used_blocks {
        warn!(
            "driver bitmap has {counted} used blocks, superblock declared {}; using the bitmap",
            volume.used_blocks
        );
        volume.used_blocks = counted;
    }

    if progress::is_cancelled(progress) {
        bail!("clone cancelled");
    }

    progress::set_stage(progress, Stage::WritingHeader);
    let options = ChecksumOptions {
        mode: config.checksum_mode,
        blocks_per_group: config.blocks_per_group,
        cpu_bits: usize::BITS as u16,
    };
    let mut out = match config.compression {
        ImageCompression::None => ImageWriter::Plain(writer),
        ImageCompression::Zstd => {
            ImageWriter::Zstd(zstd::stream::write::Encoder::new(writer, ZSTD_LEVEL)?)
        }
    };
    image::write_header(&mut out, &volume, &options)?;
    image::write_bitmap(&mut out, &bitmap)?;

    // Stream used blocks with one running-digest tag per group. The
    // accumulator is seeded here and carried across all groups.
    progress::set_stage(progress, Stage::StreamingBlocks);
    let block_size = volume.block_size as usize;
    let mut block_buf = vec![0u8; block_size];
    let mut checksum = Checksum::new(options.mode);
    let tag_size = options.tag_size();
    let mut group_fill: u32 = 0;
    let mut blocks_copied: u64 = 0;
    let mut bad_sectors: u64 = 0;

    // Free blocks are neither read nor written; only used blocks stream.
    for index in bitmap.iter_used() {
        if progress::is_cancelled(progress) {
            bail!("clone cancelled");
        }

        let offset = index
            .checked_mul(block_size as u64)
            .ok_or(ImageError::SizeOverflow("block index * block size"))?;
        let read_result = source
            .seek(SeekFrom::Start(offset))
            .and_then(|_| source.read_exact(&mut block_buf));
        match read_result {
            Ok(()) => {}
            Err(e) if config.rescue => {
                progress::push_log(
                    progress,
                    LogLevel::Warning,
                    format!("Block {index} unreadable ({e}); retrying sector by sector"),
                );
                bad_sectors += rescue::read_block(source, offset, &mut block_buf);
            }
            Err(e) => {
                return Err(e).with_context(|| {
                    format!("read failed at block {index}; enable rescue to continue past bad sectors")
                });
            }
        }

        out.write_all(&block_buf).context("image write failed")?;
        if tag_size > 0 {
            checksum.update(&block_buf);
            group_fill += 1;
            if group_fill == options.blocks_per_group {
                out.write_all(checksum.tag().as_bytes())
                    .context("image tag write failed")?;
                group_fill = 0;
            }
        }

        blocks_copied += 1;
        progress::set_block_progress(progress, blocks_copied, index);
    }

    // A partial trailing group still carries its tag.
    if tag_size > 0 && group_fill > 0 {
        out.write_all(checksum.tag().as_bytes())
            .context("image tag write failed")?;
    }

    progress::set_stage(progress, Stage::Finalizing);
    let mut inner = out.finish().context("failed to finish image stream")?;
    inner.flush().context("failed to flush image stream")?;

    info!("clone complete: {blocks_copied} blocks copied, {bad_sectors} sectors rescued");
    progress::push_log(
        progress,
        LogLevel::Info,
        format!("Clone complete: {blocks_copied} blocks, {bad_sectors} rescued sectors"),
    );

    Ok(CloneReport {
        volume,
        blocks_copied,
        bad_sectors,
    })
}
