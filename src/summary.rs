use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::image;

/// Human- and machine-readable description of an image, written to
/// `summary.json` next to the image or printed by a front end.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImageSummary {
    pub format_version: String,
    pub fs_tag: String,
    pub block_size: u32,
    pub total_blocks: u64,
    pub used_blocks: u64,
    pub device_size_bytes: u64,
    pub used_size_bytes: u64,
    pub checksum_mode: String,
    pub blocks_per_checksum_group: u32,
    pub generated: String,
}

/// Read only the header of the image at `path` and summarize it.
///
/// Does not touch the bitmap or block data, so it is cheap even for large
/// (or compressed) images.
pub fn read_summary(path: &Path) -> Result<ImageSummary> {
    let file =
        File::open(path).with_context(|| format!("failed to open {}", path.display()))?;
    let mut reader = image::maybe_decompress(BufReader::new(file))
        .context("failed to open image stream")?;
    let header = image::read_header(&mut reader)
        .with_context(|| format!("failed to parse {}", path.display()))?;

    let volume = &header.volume;
    Ok(ImageSummary {
        format_version: header.version.as_str().to_string(),
        fs_tag: volume.fs_tag.clone(),
        block_size: volume.block_size,
        total_blocks: volume.total_blocks,
        used_blocks: volume.used_blocks,
        device_size_bytes: volume.device_size,
        used_size_bytes: volume.used_size()?,
        checksum_mode: header.options.mode.as_str().to_string(),
        blocks_per_checksum_group: header.options.blocks_per_group,
        generated: Utc::now().to_rfc3339(),
    })
}

/// Write the summary as pretty JSON to `path`.
pub fn write_summary_json(summary: &ImageSummary, path: &Path) -> Result<()> {
    let json =
        serde_json::to_string_pretty(summary).context("failed to serialize image summary")?;
    std::fs::write(path, json).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}
