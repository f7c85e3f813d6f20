//! End-to-end clone/restore tests over synthetic devices.
//!
//! The filesystem driver boundary is mocked with `SyntheticVolume`: a
//! driver that reports a fixed geometry and marks a configured set of
//! blocks used. The "device" is an in-memory byte buffer with a
//! deterministic per-block pattern, so restored targets can be checked
//! byte for byte.
//!
//! Run with: cargo test --test clone_restore_e2e

use std::io::{self, Cursor, Read, Seek, SeekFrom, Write};

use blockclone::checksum::{Checksum, ChecksumMode};
use blockclone::clone::verify::{verify_checksum_file, SidecarChecksum};
use blockclone::clone::{clone_image, run_clone, CloneConfig, ImageCompression};
use blockclone::image::{self, ChecksumOptions};
use blockclone::progress::{self, request_cancel, snapshot, SharedProgress};
use blockclone::restore::{restore_image, run_restore, RestoreConfig};
use blockclone::volume::{VolumeInfo, VolumeSource};
use blockclone::{Bitmap, ImageError};

const BLOCK_SIZE: u32 = 1024;

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Deterministic content for block `index`.
fn block_pattern(index: u64) -> Vec<u8> {
    (0..BLOCK_SIZE as usize)
        .map(|j| (index as usize * 31 + j * 7) as u8)
        .collect()
}

/// A synthetic device: every block carries its pattern, used or not.
fn build_device(total_blocks: u64) -> Vec<u8> {
    let mut data = Vec::with_capacity((total_blocks * BLOCK_SIZE as u64) as usize);
    for i in 0..total_blocks {
        data.extend_from_slice(&block_pattern(i));
    }
    data
}

/// Mock filesystem driver with a fixed geometry and used set.
struct SyntheticVolume {
    info: VolumeInfo,
    used: Vec<u64>,
}

impl SyntheticVolume {
    fn new(total_blocks: u64, used: &[u64]) -> Self {
        Self {
            info: VolumeInfo {
                fs_tag: "SYNTH".to_string(),
                block_size: BLOCK_SIZE,
                total_blocks,
                used_blocks: used.len() as u64,
                device_size: total_blocks * BLOCK_SIZE as u64,
            },
            used: used.to_vec(),
        }
    }
}

impl VolumeSource for SyntheticVolume {
    fn scan_volume(&mut self) -> anyhow::Result<VolumeInfo> {
        Ok(self.info.clone())
    }

    fn build_bitmap(
        &mut self,
        _info: &VolumeInfo,
        bitmap: &mut Bitmap,
        _progress: &SharedProgress,
    ) -> anyhow::Result<()> {
        for &i in &self.used {
            bitmap.set(i);
        }
        Ok(())
    }
}

/// Clone a synthetic device into an in-memory image.
fn clone_to_vec(total_blocks: u64, used: &[u64], config: &CloneConfig) -> Vec<u8> {
    let mut source = Cursor::new(build_device(total_blocks));
    let mut driver = SyntheticVolume::new(total_blocks, used);
    let mut img = Vec::new();
    let progress = progress::new_shared();
    clone_image(&mut source, &mut driver, &mut img, config, &progress).unwrap();
    img
}

/// Restore an in-memory image onto a zeroed target of `size` bytes.
fn restore_to_vec(img: &[u8], size: usize, config: &RestoreConfig) -> Vec<u8> {
    let mut target = Cursor::new(vec![0u8; size]);
    let progress = progress::new_shared();
    restore_image(Cursor::new(img), &mut target, config, &progress).unwrap();
    target.into_inner()
}

/// Offset of the block stream inside an uncompressed "0002" image.
fn data_start(total_blocks: u64) -> usize {
    // head(36) + volume(44) + options(17) + marker(8) + bitmap + marker(8)
    36 + 44 + 17 + 8 + total_blocks as usize + 8
}

// ============================================================================
// Test Group A: clone -> restore round trips
// ============================================================================

#[test]
fn test_round_trip_preserves_used_blocks_only() {
    init_logs();
    let total = 64u64;
    let used = [0, 1, 2, 10, 20, 21, 40, 63];
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    let device_size = (total * BLOCK_SIZE as u64) as usize;
    let restored = restore_to_vec(&img, device_size, &RestoreConfig::default());
    assert_eq!(restored.len(), device_size);

    for i in 0..total {
        let off = (i * BLOCK_SIZE as u64) as usize;
        let region = &restored[off..off + BLOCK_SIZE as usize];
        if used.contains(&i) {
            assert_eq!(region, block_pattern(i), "used block {i} must round-trip");
        } else {
            // The target started zeroed; free blocks must be untouched.
            assert!(region.iter().all(|&b| b == 0), "free block {i} must stay zero");
        }
    }
}

#[test]
fn test_image_contains_only_used_blocks() {
    let total = 32u64;
    let used = [3, 4, 5];
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    // head + volume + options + marked bitmap + used * (block + 4-byte tag)
    let expected = data_start(total) + used.len() * (BLOCK_SIZE as usize + 4);
    assert_eq!(img.len(), expected);
}

#[test]
fn test_round_trip_all_checksum_modes() {
    let total = 16u64;
    let used = [1, 2, 7, 15];
    for mode in [ChecksumMode::None, ChecksumMode::Crc32, ChecksumMode::Hash64] {
        let config = CloneConfig {
            checksum_mode: mode,
            ..CloneConfig::default()
        };
        let img = clone_to_vec(total, &used, &config);
        let restored = restore_to_vec(
            &img,
            (total * BLOCK_SIZE as u64) as usize,
            &RestoreConfig::default(),
        );
        for &i in &used {
            let off = (i * BLOCK_SIZE as u64) as usize;
            assert_eq!(
                &restored[off..off + BLOCK_SIZE as usize],
                block_pattern(i),
                "mode {} block {i}",
                mode.as_str()
            );
        }
    }
}

#[test]
fn test_round_trip_multi_block_checksum_groups() {
    // 7 used blocks with groups of 3: two full groups plus a partial
    // trailing group, which still carries a tag.
    let total = 32u64;
    let used = [1, 2, 3, 8, 9, 10, 30];
    let config = CloneConfig {
        blocks_per_group: 3,
        ..CloneConfig::default()
    };
    let img = clone_to_vec(total, &used, &config);

    let expected = data_start(total) + used.len() * BLOCK_SIZE as usize + 3 * 4;
    assert_eq!(img.len(), expected);

    let restored = restore_to_vec(
        &img,
        (total * BLOCK_SIZE as u64) as usize,
        &RestoreConfig::default(),
    );
    for &i in &used {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
}

#[test]
fn test_zstd_round_trip() {
    let total = 48u64;
    let used = [0, 5, 6, 7, 47];
    let config = CloneConfig {
        compression: ImageCompression::Zstd,
        ..CloneConfig::default()
    };
    let img = clone_to_vec(total, &used, &config);
    assert_eq!(&img[..4], &[0x28, 0xB5, 0x2F, 0xFD], "zstd frame magic");

    // Restore auto-detects the compression.
    let restored = restore_to_vec(
        &img,
        (total * BLOCK_SIZE as u64) as usize,
        &RestoreConfig::default(),
    );
    for &i in &used {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
}

// ============================================================================
// Test Group B: write coalescing
// ============================================================================

#[test]
fn test_coalescing_is_content_neutral() {
    let total = 128u64;
    // Long runs, short runs, isolated blocks, and a run crossing the cache
    // boundary.
    let mut used: Vec<u64> = (10..80).collect();
    used.push(0);
    used.push(99);
    used.extend(110..113);
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    let size = (total * BLOCK_SIZE as u64) as usize;
    let no_coalescing = restore_to_vec(
        &img,
        size,
        &RestoreConfig {
            max_block_cache: 1,
            ..RestoreConfig::default()
        },
    );
    let coalesced = restore_to_vec(
        &img,
        size,
        &RestoreConfig {
            max_block_cache: 64,
            ..RestoreConfig::default()
        },
    );
    let oddball = restore_to_vec(
        &img,
        size,
        &RestoreConfig {
            max_block_cache: 7,
            ..RestoreConfig::default()
        },
    );

    assert_eq!(no_coalescing, coalesced);
    assert_eq!(no_coalescing, oddball);
}

// ============================================================================
// Test Group C: checksum failures and legacy-shift recovery
// ============================================================================

/// Build an image whose block stream reproduces the historical bug: every
/// 4-byte CRC tag sits one tag width later than the reader expects.
fn build_shifted_image(total: u64, used: &[u64]) -> Vec<u8> {
    let mut volume = VolumeInfo {
        fs_tag: "SYNTH".to_string(),
        block_size: BLOCK_SIZE,
        total_blocks: total,
        used_blocks: used.len() as u64,
        device_size: total * BLOCK_SIZE as u64,
    };
    volume.normalize().unwrap();

    let options = ChecksumOptions {
        mode: ChecksumMode::Crc32,
        blocks_per_group: 1,
        cpu_bits: 32,
    };
    let mut bitmap = Bitmap::new(total).unwrap();
    for &i in used {
        bitmap.set(i);
    }

    let mut img = Vec::new();
    image::write_header(&mut img, &volume, &options).unwrap();
    image::write_bitmap(&mut img, &bitmap).unwrap();

    // The buggy writer effectively emitted 4 spurious bytes before the
    // first block, displacing every subsequent tag by 4.
    img.extend_from_slice(&[0xEE; 4]);
    let mut cs = Checksum::new(ChecksumMode::Crc32);
    for &i in used {
        let block = block_pattern(i);
        img.extend_from_slice(&block);
        cs.update(&block);
        img.extend_from_slice(cs.tag().as_bytes());
    }
    img
}

#[test]
fn test_legacy_shift_recovery_restores_correct_content() {
    init_logs();
    let total = 16u64;
    let used = [2, 3, 9];
    let img = build_shifted_image(total, &used);

    let mut target = Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64) as usize]);
    let progress = progress::new_shared();
    let report = restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig::default(),
        &progress,
    )
    .unwrap();
    assert!(report.shift_recovered);

    let restored = target.into_inner();
    for &i in &used {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(
            &restored[off..off + BLOCK_SIZE as usize],
            block_pattern(i),
            "block {i} after shift recovery"
        );
    }
}

#[test]
fn test_genuine_corruption_fails_with_checksum_error() {
    let total = 16u64;
    let used = [1, 2];
    let mut img = clone_to_vec(total, &used, &CloneConfig::default());
    // Flip a data byte inside the first streamed block.
    let off = data_start(total) + 5;
    img[off] ^= 0xFF;

    let mut target = Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64) as usize]);
    let progress = progress::new_shared();
    let err = restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig::default(),
        &progress,
    )
    .unwrap_err();
    match err.downcast_ref::<ImageError>() {
        Some(ImageError::ChecksumMismatch { block: 1, .. }) => {}
        other => panic!("expected ChecksumMismatch at block 1, got {other:?}"),
    }
}

#[test]
fn test_ignore_checksum_errors_keeps_going() {
    init_logs();
    let total = 16u64;
    let used = [1, 2, 3];
    let mut img = clone_to_vec(total, &used, &CloneConfig::default());
    let corrupt_off = data_start(total) + 5;
    img[corrupt_off] ^= 0xFF;

    let restored = restore_to_vec(
        &img,
        (total * BLOCK_SIZE as u64) as usize,
        &RestoreConfig {
            ignore_checksum_errors: true,
            ..RestoreConfig::default()
        },
    );

    // Block 1 carries the corruption as read; blocks 2 and 3 must still be
    // intact, proving the failed recovery probe did not desynchronize the
    // stream.
    let mut expected_block1 = block_pattern(1);
    expected_block1[5] ^= 0xFF;
    let off1 = (BLOCK_SIZE as u64) as usize;
    assert_eq!(&restored[off1..off1 + BLOCK_SIZE as usize], expected_block1);
    for i in [2u64, 3] {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
}

// ============================================================================
// Test Group D: rescue mode
// ============================================================================

/// A device whose reads fail inside configured byte ranges.
struct FlakySource {
    data: Vec<u8>,
    pos: u64,
    bad_ranges: Vec<(u64, u64)>,
}

impl Read for FlakySource {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let start = self.pos;
        let end = start + buf.len() as u64;
        for &(lo, hi) in &self.bad_ranges {
            if start < hi && end > lo {
                return Err(io::Error::other("simulated media error"));
            }
        }
        let mut cursor = Cursor::new(&self.data);
        cursor.set_position(start);
        let n = cursor.read(buf)?;
        self.pos += n as u64;
        Ok(n)
    }
}

impl Seek for FlakySource {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.pos = match pos {
            SeekFrom::Start(o) => o,
            SeekFrom::End(o) => (self.data.len() as i64 + o) as u64,
            SeekFrom::Current(o) => (self.pos as i64 + o) as u64,
        };
        Ok(self.pos)
    }
}

#[test]
fn test_rescue_substitutes_sentinel_for_bad_sectors() {
    init_logs();
    let total = 8u64;
    let used = [1, 2, 3];
    // Second sector of block 2 is unreadable.
    let bad_lo = 2 * BLOCK_SIZE as u64 + 512;
    let mut source = FlakySource {
        data: build_device(total),
        pos: 0,
        bad_ranges: vec![(bad_lo, bad_lo + 512)],
    };
    let mut driver = SyntheticVolume::new(total, &used);
    let mut img = Vec::new();
    let progress = progress::new_shared();
    let config = CloneConfig {
        rescue: true,
        ..CloneConfig::default()
    };
    let report = clone_image(&mut source, &mut driver, &mut img, &config, &progress).unwrap();
    assert_eq!(report.bad_sectors, 1);

    let restored = restore_to_vec(
        &img,
        (total * BLOCK_SIZE as u64) as usize,
        &RestoreConfig::default(),
    );

    // Block 1 and block 3 intact; block 2 has its first sector intact and
    // the sentinel in the damaged sector.
    for i in [1u64, 3] {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
    let b2 = (2 * BLOCK_SIZE as u64) as usize;
    assert_eq!(&restored[b2..b2 + 512], &block_pattern(2)[..512]);
    assert_eq!(&restored[b2 + 512..b2 + 521], b"BADSECTOR");
    assert!(restored[b2 + 521..b2 + 1024].iter().all(|&b| b == 0));
}

#[test]
fn test_read_error_without_rescue_aborts() {
    let total = 8u64;
    let used = [1, 2, 3];
    let bad_lo = 2 * BLOCK_SIZE as u64;
    let mut source = FlakySource {
        data: build_device(total),
        pos: 0,
        bad_ranges: vec![(bad_lo, bad_lo + 512)],
    };
    let mut driver = SyntheticVolume::new(total, &used);
    let mut img = Vec::new();
    let progress = progress::new_shared();
    let err = clone_image(
        &mut source,
        &mut driver,
        &mut img,
        &CloneConfig::default(),
        &progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("block 2"), "{err:#}");
}

// ============================================================================
// Test Group E: header cross-checks and size preflight
// ============================================================================

/// Build an image whose header deliberately disagrees with its bitmap.
fn build_miscounted_image(total: u64, used: &[u64], declared_used: u64) -> Vec<u8> {
    let volume = VolumeInfo {
        fs_tag: "SYNTH".to_string(),
        block_size: BLOCK_SIZE,
        total_blocks: total,
        used_blocks: declared_used,
        device_size: total * BLOCK_SIZE as u64,
    };
    let options = ChecksumOptions {
        mode: ChecksumMode::None,
        blocks_per_group: 1,
        cpu_bits: 64,
    };
    let mut bitmap = Bitmap::new(total).unwrap();
    for &i in used {
        bitmap.set(i);
    }

    let mut img = Vec::new();
    image::write_header(&mut img, &volume, &options).unwrap();
    image::write_bitmap(&mut img, &bitmap).unwrap();
    for &i in used {
        img.extend_from_slice(&block_pattern(i));
    }
    img
}

#[test]
fn test_used_count_mismatch_strict_vs_lenient() {
    let total = 16u64;
    let used = [1, 2];
    let img = build_miscounted_image(total, &used, 3);

    let progress = progress::new_shared();
    let mut target = Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64) as usize]);
    let err = restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig {
            strict_used_count: true,
            ..RestoreConfig::default()
        },
        &progress,
    )
    .unwrap_err();
    match err.downcast_ref::<ImageError>() {
        Some(ImageError::UsedCountMismatch { header: 3, bitmap: 2 }) => {}
        other => panic!("expected UsedCountMismatch, got {other:?}"),
    }

    // Lenient mode logs and proceeds on the bitmap's authority.
    let restored = restore_to_vec(
        &img,
        (total * BLOCK_SIZE as u64) as usize,
        &RestoreConfig::default(),
    );
    for &i in &used {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
}

#[test]
fn test_device_target_too_small_is_size_mismatch() {
    let total = 16u64;
    let used = [1];
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    // A "device" half the required size.
    let mut target = Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64 / 2) as usize]);
    let progress = progress::new_shared();
    let err = restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig {
            target_is_device: true,
            ..RestoreConfig::default()
        },
        &progress,
    )
    .unwrap_err();
    match err.downcast_ref::<ImageError>() {
        Some(ImageError::SizeMismatch { .. }) => {}
        other => panic!("expected SizeMismatch, got {other:?}"),
    }
}

// ============================================================================
// Test Group F: degraded write targets
// ============================================================================

/// A target whose writes fail inside configured byte ranges.
struct FlakyTarget {
    inner: Cursor<Vec<u8>>,
    bad_ranges: Vec<(u64, u64)>,
}

impl Write for FlakyTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let start = self.inner.position();
        let end = start + buf.len() as u64;
        for &(lo, hi) in &self.bad_ranges {
            if start < hi && end > lo {
                return Err(io::Error::other("simulated write failure"));
            }
        }
        self.inner.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl Seek for FlakyTarget {
    fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
        self.inner.seek(pos)
    }
}

#[test]
fn test_skip_write_errors_continues_past_bad_block() {
    init_logs();
    let total = 16u64;
    let used = [1, 2, 3];
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    let bad_lo = 2 * BLOCK_SIZE as u64;
    let mut target = FlakyTarget {
        inner: Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64) as usize]),
        bad_ranges: vec![(bad_lo, bad_lo + BLOCK_SIZE as u64)],
    };
    let progress = progress::new_shared();
    let report = restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig {
            skip_write_errors: true,
            ..RestoreConfig::default()
        },
        &progress,
    )
    .unwrap();
    assert_eq!(report.skipped_writes, 1);

    let restored = target.inner.into_inner();
    for i in [1u64, 3] {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
    // The unwritable block stayed zero.
    let b2 = (2 * BLOCK_SIZE as u64) as usize;
    assert!(restored[b2..b2 + BLOCK_SIZE as usize].iter().all(|&b| b == 0));
}

#[test]
fn test_write_error_without_skip_flag_aborts() {
    let total = 16u64;
    let used = [1, 2, 3];
    let img = clone_to_vec(total, &used, &CloneConfig::default());

    let bad_lo = 2 * BLOCK_SIZE as u64;
    let mut target = FlakyTarget {
        inner: Cursor::new(vec![0u8; (total * BLOCK_SIZE as u64) as usize]),
        bad_ranges: vec![(bad_lo, bad_lo + BLOCK_SIZE as u64)],
    };
    let progress = progress::new_shared();
    assert!(restore_image(
        Cursor::new(&img),
        &mut target,
        &RestoreConfig::default(),
        &progress,
    )
    .is_err());
}

// ============================================================================
// Test Group G: file-path wrappers, sidecars, summary
// ============================================================================

#[test]
fn test_path_round_trip_with_sidecar_and_summary() {
    init_logs();
    let tmp = tempfile::TempDir::new().unwrap();
    let image_path = tmp.path().join("synth.img");
    let target_path = tmp.path().join("restored.bin");

    let total = 32u64;
    let used = [0, 7, 8, 9];
    let mut source = Cursor::new(build_device(total));
    let mut driver = SyntheticVolume::new(total, &used);
    let progress = progress::new_shared();
    let config = CloneConfig {
        sidecar: Some(SidecarChecksum::Crc32),
        ..CloneConfig::default()
    };
    let report = run_clone(&mut source, &mut driver, &image_path, &config, &progress).unwrap();
    assert_eq!(report.blocks_copied, used.len() as u64);

    // Sidecar validates the file on disk.
    assert!(tmp.path().join("synth.img.crc32").exists());
    verify_checksum_file(&image_path, SidecarChecksum::Crc32).unwrap();

    // Header-only summary matches the cloned volume.
    let summary = blockclone::read_summary(&image_path).unwrap();
    assert_eq!(summary.fs_tag, "SYNTH");
    assert_eq!(summary.format_version, "0002");
    assert_eq!(summary.total_blocks, total);
    assert_eq!(summary.used_blocks, used.len() as u64);
    assert_eq!(summary.checksum_mode, "crc32");
    let summary_path = tmp.path().join("summary.json");
    blockclone::write_summary_json(&summary, &summary_path).unwrap();
    assert!(summary_path.exists());

    // Restore through the path wrapper.
    let progress = progress::new_shared();
    let report = run_restore(
        &image_path,
        &target_path,
        &RestoreConfig::default(),
        &progress,
    )
    .unwrap();
    assert_eq!(report.blocks_restored, used.len() as u64);

    let restored = std::fs::read(&target_path).unwrap();
    for &i in &used {
        let off = (i * BLOCK_SIZE as u64) as usize;
        assert_eq!(&restored[off..off + BLOCK_SIZE as usize], block_pattern(i));
    }
}

#[test]
fn test_plain_file_target_gets_full_device_size() {
    // The last block is free: restoring into a plain file must still
    // zero-fill it so the file spans the whole device.
    let tmp = tempfile::TempDir::new().unwrap();
    let image_path = tmp.path().join("synth.img");
    let target_path = tmp.path().join("restored.bin");

    let total = 16u64;
    let used = [0, 1];
    let mut source = Cursor::new(build_device(total));
    let mut driver = SyntheticVolume::new(total, &used);
    let progress = progress::new_shared();
    run_clone(
        &mut source,
        &mut driver,
        &image_path,
        &CloneConfig::default(),
        &progress,
    )
    .unwrap();

    let progress = progress::new_shared();
    run_restore(
        &image_path,
        &target_path,
        &RestoreConfig::default(),
        &progress,
    )
    .unwrap();

    let metadata = std::fs::metadata(&target_path).unwrap();
    assert_eq!(metadata.len(), total * BLOCK_SIZE as u64);
}

// ============================================================================
// Test Group H: cancellation and progress
// ============================================================================

#[test]
fn test_cancelled_clone_aborts_and_marks_progress() {
    let total = 16u64;
    let mut source = Cursor::new(build_device(total));
    let mut driver = SyntheticVolume::new(total, &[1, 2]);
    let mut img = Vec::new();
    let progress = progress::new_shared();
    request_cancel(&progress);

    let err = clone_image(
        &mut source,
        &mut driver,
        &mut img,
        &CloneConfig::default(),
        &progress,
    )
    .unwrap_err();
    assert!(err.to_string().contains("cancelled"));

    let snap = snapshot(&progress);
    assert!(snap.finished);
    assert!(snap.error.is_some());
}

#[test]
fn test_monitor_observes_clone_to_completion() {
    let total = 64u64;
    let used: Vec<u64> = (0..48).collect();
    let mut source = Cursor::new(build_device(total));
    let mut driver = SyntheticVolume::new(total, &used);
    let mut img = Vec::new();
    let progress = progress::new_shared();

    let monitor = blockclone::spawn_monitor(
        progress.clone(),
        std::time::Duration::from_millis(1),
        |_snap| {},
    );

    clone_image(
        &mut source,
        &mut driver,
        &mut img,
        &CloneConfig::default(),
        &progress,
    )
    .unwrap();

    // The monitor terminates on its own once the engine marks completion.
    monitor.join().unwrap();
    let snap = snapshot(&progress);
    assert_eq!(snap.stage, blockclone::Stage::Done);
    assert_eq!(snap.blocks_copied, used.len() as u64);
}
