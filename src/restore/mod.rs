use std::fs::OpenOptions;
use std::io::{self, BufReader, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{info, warn};

use crate::checksum::{Checksum, Tag, MAX_TAG_SIZE};
use crate::error::ImageError;
use crate::image::{self, ChecksumOptions};
use crate::progress::{self, LogLevel, SharedProgress, Stage};
use crate::volume::VolumeInfo;

/// Configuration for a restore run.
#[derive(Debug, Clone)]
pub struct RestoreConfig {
    /// Maximum contiguous used blocks coalesced into one positioned write.
    /// 1 disables coalescing. Purely a performance knob; must not change
    /// the bytes that land on the target.
    pub max_block_cache: u64,
    /// Log checksum mismatches and keep going instead of aborting.
    pub ignore_checksum_errors: bool,
    /// Log target write failures and continue past the failing block.
    pub skip_write_errors: bool,
    /// Treat a bitmap/header used-count disagreement as fatal.
    pub strict_used_count: bool,
    /// Refuse a device target smaller than the image's device size.
    pub check_target_size: bool,
    /// The target is a block device rather than a plain image file.
    pub target_is_device: bool,
}

impl Default for RestoreConfig {
    fn default() -> Self {
        Self {
            max_block_cache: 64,
            ignore_checksum_errors: false,
            skip_write_errors: false,
            strict_used_count: false,
            check_target_size: true,
            target_is_device: false,
        }
    }
}

impl RestoreConfig {
    fn validate(&self) -> Result<()> {
        if self.max_block_cache == 0 {
            bail!("block cache size must be at least 1");
        }
        Ok(())
    }
}

/// Totals from a completed restore.
#[derive(Debug, Clone)]
pub struct RestoreReport {
    pub volume: VolumeInfo,
    pub blocks_restored: u64,
    pub groups_verified: u64,
    /// True if the stream was realigned around the historical shifted-tag bug.
    pub shift_recovered: bool,
    /// Blocks dropped because of write errors (skip-write-errors mode).
    pub skipped_writes: u64,
}

/// Reader over the tagged block stream: drives the running checksum,
/// verifies one tag per group, and recovers images written by the
/// historical build that emitted 4-byte CRC tags shifted by one tag width.
struct BlockStream<R: Read> {
    reader: R,
    /// Probe bytes pushed back after a failed recovery attempt, consumed
    /// before the reader so the stream stays aligned.
    pending: Vec<u8>,
    checksum: Checksum,
    options: ChecksumOptions,
    group_fill: u32,
    groups_verified: u64,
    ignore_errors: bool,
    shift_recovered: bool,
}

impl<R: Read> BlockStream<R> {
    fn new(reader: R, options: ChecksumOptions, ignore_errors: bool) -> Self {
        Self {
            reader,
            pending: Vec::new(),
            checksum: Checksum::new(options.mode),
            options,
            group_fill: 0,
            groups_verified: 0,
            ignore_errors,
            shift_recovered: false,
        }
    }

    fn read_exact_buffered(&mut self, buf: &mut [u8]) -> io::Result<()> {
        let n = self.pending.len().min(buf.len());
        if n > 0 {
            buf[..n].copy_from_slice(&self.pending[..n]);
            self.pending.drain(..n);
        }
        if n < buf.len() {
            self.reader.read_exact(&mut buf[n..])?;
        }
        Ok(())
    }

    /// Read the next used block into `buf`, verifying the group tag when a
    /// group boundary is reached. On legacy-shift recovery, `buf` is
    /// rewritten with the reconstituted block content.
    fn next_block(&mut self, buf: &mut [u8], block_index: u64) -> Result<(), ImageError> {
        let tag_size = self.options.tag_size();
        let saved = if tag_size > 0 {
            Some(self.checksum.clone())
        } else {
            None
        };

        self.read_exact_buffered(buf)?;
        if tag_size == 0 {
            return Ok(());
        }

        self.checksum.update(buf);
        self.group_fill += 1;
        if self.group_fill == self.options.blocks_per_group {
            self.group_fill = 0;
            self.verify_group(buf, block_index, saved.expect("saved state"))?;
        }
        Ok(())
    }

    fn verify_group(
        &mut self,
        block: &mut [u8],
        block_index: u64,
        saved: Checksum,
    ) -> Result<(), ImageError> {
        let tag_size = self.options.tag_size();
        let mut tag_buf = [0u8; MAX_TAG_SIZE];
        self.read_exact_buffered(&mut tag_buf[..tag_size])?;
        let stream_tag = Tag::from_slice(&tag_buf[..tag_size]);
        let computed = self.checksum.tag();
        if stream_tag == computed {
            self.groups_verified += 1;
            return Ok(());
        }

        // Images from the buggy historical build carry each 4-byte CRC tag
        // one tag width later in the stream. Reinterpret what we read as if
        // so: true block = block[4..] ++ tag-as-read, true tag = the next 4
        // bytes. Recompute from the pre-block state; on a match, accept and
        // stay on the corrected alignment for the rest of the stream.
        if tag_size == 4 && self.options.blocks_per_group == 1 && block.len() >= 4 {
            let mut probe = [0u8; 4];
            match self.read_exact_buffered(&mut probe) {
                Ok(()) => {
                    let mut shifted = Vec::with_capacity(block.len());
                    shifted.extend_from_slice(&block[4..]);
                    shifted.extend_from_slice(stream_tag.as_bytes());

                    let mut replay = saved;
                    replay.update(&shifted);
                    if replay.tag() == Tag::from_slice(&probe) {
                        warn!(
                            "recovered shifted checksum tag at block {block_index}; \
                             continuing on corrected stream alignment"
                        );
                        block.copy_from_slice(&shifted);
                        self.checksum = replay;
                        self.shift_recovered = true;
                        self.groups_verified += 1;
                        return Ok(());
                    }
                    // Not the shift bug. Push the probe bytes back so the
                    // ignore path continues on the original alignment.
                    self.pending.splice(0..0, probe);
                }
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {}
                Err(e) => return Err(e.into()),
            }
        }

        if self.ignore_errors {
            warn!(
                "ignoring checksum mismatch at block {block_index} \
                 (expected {}, got {})",
                stream_tag.to_hex(),
                computed.to_hex()
            );
            return Ok(());
        }

        Err(ImageError::ChecksumMismatch {
            block: block_index,
            expected: stream_tag.to_hex(),
            actual: computed.to_hex(),
        })
    }

    /// Verify the tag of a partial trailing group, if one is open.
    fn finish(&mut self, last_block: u64) -> Result<(), ImageError> {
        let tag_size = self.options.tag_size();
        if tag_size == 0 || self.group_fill == 0 {
            return Ok(());
        }
        self.group_fill = 0;

        let mut tag_buf = [0u8; MAX_TAG_SIZE];
        self.read_exact_buffered(&mut tag_buf[..tag_size])?;
        let stream_tag = Tag::from_slice(&tag_buf[..tag_size]);
        let computed = self.checksum.tag();
        if stream_tag == computed {
            self.groups_verified += 1;
            return Ok(());
        }
        if self.ignore_errors {
            warn!("ignoring checksum mismatch in trailing group at block {last_block}");
            return Ok(());
        }
        Err(ImageError::ChecksumMismatch {
            block: last_block,
            expected: stream_tag.to_hex(),
            actual: computed.to_hex(),
        })
    }
}

fn finalize_progress<T>(progress: &SharedProgress, result: Result<T>) -> Result<T> {
    match &result {
        Ok(_) => progress::mark_finished(progress, None),
        Err(e) => progress::mark_finished(progress, Some(format!("{e:#}"))),
    }
    result
}

/// Restore the image at `image_path` onto `target_path`, then sync.
pub fn run_restore(
    image_path: &Path,
    target_path: &Path,
    config: &RestoreConfig,
    progress: &SharedProgress,
) -> Result<RestoreReport> {
    let result = run_restore_inner(image_path, target_path, config, progress);
    finalize_progress(progress, result)
}

fn run_restore_inner(
    image_path: &Path,
    target_path: &Path,
    config: &RestoreConfig,
    progress: &SharedProgress,
) -> Result<RestoreReport> {
    let image = std::fs::File::open(image_path)
        .with_context(|| format!("failed to open image {}", image_path.display()))?;

    let mut open_opts = OpenOptions::new();
    open_opts.read(true).write(true);
    if !config.target_is_device {
        open_opts.create(true);
    }
    let mut target = open_opts
        .open(target_path)
        .with_context(|| format!("cannot open {} for writing", target_path.display()))?;

    let report = restore_inner(BufReader::new(image), &mut target, config, progress)?;

    target.sync_all().context("failed to sync target")?;
    Ok(report)
}

/// Restore an image stream onto `target`. Core entry point for callers
/// that manage their own endpoints; [`run_restore`] is the path wrapper.
pub fn restore_image<R: Read>(
    image: R,
    target: &mut (impl Write + Seek),
    config: &RestoreConfig,
    progress: &SharedProgress,
) -> Result<RestoreReport> {
    let result = restore_inner(image, target, config, progress);
    finalize_progress(progress, result)
}

fn restore_inner<R: Read>(
    image: R,
    target: &mut (impl Write + Seek),
    config: &RestoreConfig,
    progress: &SharedProgress,
) -> Result<RestoreReport> {
    config.validate()?;

    progress::set_stage(progress, Stage::ReadingHeader);
    progress::push_log(progress, LogLevel::Info, "Reading image header...");
    let mut reader = image::maybe_decompress(image).context("failed to open image stream")?;
    let header = image::read_header(&mut reader)?;
    let mut volume = header.volume.clone();
    if volume.normalize()? {
        progress::push_log(
            progress,
            LogLevel::Warning,
            format!("Corrected declared device size to {}", volume.device_size),
        );
    }
    info!(
        "image: {} {} blocks of {} bytes, {} used, checksum {}",
        volume.fs_tag,
        volume.total_blocks,
        volume.block_size,
        volume.used_blocks,
        header.options.mode.as_str()
    );

    // Preflight: a device target must be large enough for the whole volume.
    if config.target_is_device && config.check_target_size {
        let available = target.seek(SeekFrom::End(0))?;
        target.seek(SeekFrom::Start(0))?;
        if available < volume.device_size {
            return Err(ImageError::SizeMismatch {
                needed: volume.device_size,
                available,
            }
            .into());
        }
    }

    if progress::is_cancelled(progress) {
        bail!("restore cancelled");
    }

    progress::set_stage(progress, Stage::BuildingBitmap);
    progress::set_total_blocks(progress, volume.total_blocks);
    let bitmap = image::read_bitmap(&mut reader, &header, config.strict_used_count)?;

    progress::set_stage(progress, Stage::StreamingBlocks);
    let block_size = volume.block_size as usize;
    let mut stream = BlockStream::new(reader, header.options, config.ignore_checksum_errors);

    // Contiguous used blocks accumulate in `run` and flush as one
    // positioned write once the run ends or the cache fills. Free blocks
    // cost nothing: the positioned writes seek past them.
    let mut run: Vec<u8> = Vec::new();
    let mut blocks_restored: u64 = 0;
    let mut skipped_writes: u64 = 0;
    let mut last_used_block: u64 = 0;

    let mut index: u64 = 0;
    while index < volume.total_blocks {
        if progress::is_cancelled(progress) {
            bail!("restore cancelled");
        }
        if !bitmap.test(index) {
            index += 1;
            continue;
        }

        let run_blocks = bitmap.run_of_used(index, config.max_block_cache);
        let run_bytes = usize::try_from(run_blocks)
            .ok()
            .and_then(|n| n.checked_mul(block_size))
            .ok_or(ImageError::SizeOverflow("run buffer size"))?;
        run.clear();
        run.resize(run_bytes, 0);

        for k in 0..run_blocks {
            if progress::is_cancelled(progress) {
                bail!("restore cancelled");
            }
            let block_index = index + k;
            let off = k as usize * block_size;
            stream.next_block(&mut run[off..off + block_size], block_index)?;
            blocks_restored += 1;
            last_used_block = block_index;
            progress::set_block_progress(progress, blocks_restored, block_index);
        }

        skipped_writes += flush_run(
            target,
            index,
            &run,
            block_size,
            config.skip_write_errors,
            progress,
        )?;
        index += run_blocks;
    }
    stream.finish(last_used_block)?;

    // When the final block is free and the target is a plain file, write
    // explicit zeros there so the file spans the full device size and
    // loop-mounting the result sees the right geometry.
    if !config.target_is_device && volume.total_blocks > 0 {
        let last = volume.total_blocks - 1;
        if !bitmap.test(last) {
            let offset = last
                .checked_mul(block_size as u64)
                .ok_or(ImageError::SizeOverflow("final block offset"))?;
            target.seek(SeekFrom::Start(offset))?;
            target
                .write_all(&vec![0u8; block_size])
                .context("failed to zero-fill final block")?;
        }
    }

    progress::set_stage(progress, Stage::Finalizing);
    target.flush().context("failed to flush target")?;

    info!(
        "restore complete: {blocks_restored} blocks, {} groups verified, {skipped_writes} skipped",
        stream.groups_verified
    );
    progress::push_log(
        progress,
        LogLevel::Info,
        format!("Restore complete: {blocks_restored} blocks written"),
    );

    Ok(RestoreReport {
        volume,
        blocks_restored,
        groups_verified: stream.groups_verified,
        shift_recovered: stream.shift_recovered,
        skipped_writes,
    })
}

/// Write one coalesced run at its absolute offset.
///
/// Returns the number of blocks skipped (nonzero only in
/// skip-write-errors mode, where the run is retried block by block so a
/// single bad region does not lose the whole run).
fn flush_run(
    target: &mut (impl Write + Seek),
    run_start: u64,
    run: &[u8],
    block_size: usize,
    skip_write_errors: bool,
    progress: &SharedProgress,
) -> Result<u64> {
    let offset = run_start
        .checked_mul(block_size as u64)
        .ok_or(ImageError::SizeOverflow("run offset"))?;

    let write = target
        .seek(SeekFrom::Start(offset))
        .and_then(|_| target.write_all(run));
    match write {
        Ok(()) => Ok(0),
        Err(e) if skip_write_errors => {
            warn!("write failed at block {run_start} ({e}); retrying block by block");
            let mut skipped = 0;
            for (i, chunk) in run.chunks(block_size).enumerate() {
                let block_offset = offset + (i * block_size) as u64;
                let retry = target
                    .seek(SeekFrom::Start(block_offset))
                    .and_then(|_| target.write_all(chunk));
                if retry.is_err() {
                    skipped += 1;
                    progress::push_log(
                        progress,
                        LogLevel::Warning,
                        format!("Skipped unwritable block {}", run_start + i as u64),
                    );
                }
            }
            Ok(skipped)
        }
        Err(e) => Err(e).with_context(|| format!("write failed at block {run_start}")),
    }
}
