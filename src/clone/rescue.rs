//! Sector-granular fallback reads for damaged source media.
//!
//! When a whole-block read fails with an I/O error and rescue mode is on,
//! the clone engine retries the block as `block_size / 512` independent
//! sector reads. Sectors that still fail are replaced with a fixed
//! sentinel pattern instead of aborting the run, so the engine keeps
//! advancing through the damaged region.

use std::io::{Read, Seek, SeekFrom};

use log::warn;

pub(crate) const SECTOR_SIZE: usize = 512;

/// Literal marker written at the start of an unreadable sector.
pub const BAD_SECTOR_MARKER: &[u8] = b"BADSECTOR";

/// Fill `out` with the sentinel pattern: the marker text, then zero filler.
pub(crate) fn fill_sentinel(out: &mut [u8]) {
    out.fill(0);
    let n = BAD_SECTOR_MARKER.len().min(out.len());
    out[..n].copy_from_slice(&BAD_SECTOR_MARKER[..n]);
}

fn try_read_at(
    source: &mut (impl Read + Seek),
    offset: u64,
    out: &mut [u8],
) -> std::io::Result<()> {
    source.seek(SeekFrom::Start(offset))?;
    source.read_exact(out)
}

/// Read one sector at `offset`, substituting the sentinel on failure.
///
/// Returns false if the sector was unreadable. Never propagates the error;
/// the whole point is to keep the clone advancing.
pub(crate) fn read_sector(
    source: &mut (impl Read + Seek),
    offset: u64,
    out: &mut [u8],
) -> bool {
    match try_read_at(source, offset, out) {
        Ok(()) => true,
        Err(e) => {
            warn!("unreadable sector at byte offset {offset}: {e}");
            fill_sentinel(out);
            false
        }
    }
}

/// Re-read a failed block sector by sector into `block`.
///
/// Returns the number of sectors that had to be replaced with the sentinel.
pub(crate) fn read_block(
    source: &mut (impl Read + Seek),
    block_offset: u64,
    block: &mut [u8],
) -> u64 {
    let mut bad = 0;
    for (i, chunk) in block.chunks_mut(SECTOR_SIZE).enumerate() {
        let offset = block_offset + (i * SECTOR_SIZE) as u64;
        if !read_sector(source, offset, chunk) {
            bad += 1;
        }
    }
    bad
}
