use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};

const READ_BUF_SIZE: usize = 1024 * 1024; // 1 MB

/// Whole-file sidecar checksum algorithm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SidecarChecksum {
    Sha256,
    Crc32,
}

impl SidecarChecksum {
    pub fn as_str(&self) -> &'static str {
        match self {
            SidecarChecksum::Sha256 => "sha256",
            SidecarChecksum::Crc32 => "crc32",
        }
    }
}

/// Compute a checksum over the file at `path`.
/// Returns the hex-encoded checksum string.
pub fn compute_checksum(path: &Path, kind: SidecarChecksum) -> Result<String> {
    let file = File::open(path)
        .with_context(|| format!("failed to open {} for checksum", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut buf = vec![0u8; READ_BUF_SIZE];

    match kind {
        SidecarChecksum::Sha256 => {
            use sha2::{Digest, Sha256};
            let mut hasher = Sha256::new();
            loop {
                let n = reader.read(&mut buf).context("checksum read error")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(format!("{:x}", hasher.finalize()))
        }
        SidecarChecksum::Crc32 => {
            let mut hasher = crc32fast::Hasher::new();
            loop {
                let n = reader.read(&mut buf).context("checksum read error")?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
            }
            Ok(format!("{:08x}", hasher.finalize()))
        }
    }
}

fn sidecar_path(file_path: &Path, kind: SidecarChecksum) -> PathBuf {
    file_path.with_extension(format!(
        "{}.{}",
        file_path.extension().unwrap_or_default().to_string_lossy(),
        kind.as_str()
    ))
}

/// Write a checksum sidecar file next to the image file.
///
/// Given `disk.img` and SHA256, writes `disk.img.sha256` in the format
/// `{hash}  {filename}` (compatible with sha256sum).
pub fn write_checksum_file(
    checksum: &str,
    file_path: &Path,
    kind: SidecarChecksum,
) -> Result<()> {
    let sidecar = sidecar_path(file_path, kind);
    let file_name = file_path.file_name().unwrap_or_default().to_string_lossy();

    let mut f = File::create(&sidecar)
        .with_context(|| format!("failed to create {}", sidecar.display()))?;
    writeln!(f, "{checksum}  {file_name}")
        .with_context(|| format!("failed to write {}", sidecar.display()))?;

    Ok(())
}

/// Recompute the file's checksum and compare against its sidecar.
pub fn verify_checksum_file(file_path: &Path, kind: SidecarChecksum) -> Result<()> {
    let sidecar = sidecar_path(file_path, kind);
    let content = std::fs::read_to_string(&sidecar)
        .with_context(|| format!("failed to read {}", sidecar.display()))?;
    let expected = content
        .split_whitespace()
        .next()
        .with_context(|| format!("empty sidecar file {}", sidecar.display()))?;

    let actual = compute_checksum(file_path, kind)?;
    if actual != expected {
        bail!(
            "sidecar checksum mismatch for {}: expected {expected}, got {actual}",
            file_path.display()
        );
    }
    Ok(())
}
