//! Image container codec.
//!
//! On-disk layout, all integers little-endian:
//!
//! ```text
//! image head (36 bytes):
//!   magic[16] + tool_version[14] + format_version[4] + endianness(u16)
//! volume info (44 bytes):
//!   fs_tag[16] + device_size(u64) + total_blocks(u64)
//!   + used_blocks(u64) + block_size(u32)
//! checksum options ("0002" only, 17 bytes):
//!   feature_size(u32) + image_version(u16) + cpu_bits(u16)
//!   + checksum_mode(u16) + checksum_size(u16) + blocks_per_group(u32)
//!   + bitmap_mode(u8)
//! bitmap:
//!   marker[8] + one byte per block (1/0) + marker[8]
//! block stream:
//!   used blocks in index order, one checksum tag per group
//! ```
//!
//! The legacy "0001" generation has no options record; it hard-codes
//! crc32 tags, 4 bytes, one block per group, byte-mode bitmap. The codec
//! reads both generations and writes only "0002".
//!
//! A container may be zstd-compressed as a whole; [`maybe_decompress`]
//! sniffs the frame magic and stacks a decoder.

use std::io::{self, Read, Write};

use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use log::warn;

use crate::bitmap::Bitmap;
use crate::checksum::ChecksumMode;
use crate::error::ImageError;
use crate::volume::VolumeInfo;

pub(crate) const IMAGE_MAGIC: &[u8; 16] = b"blockclone-img\0\0";
pub(crate) const BITMAP_MARKER: &[u8; 8] = b"BiTmAgIc";

const TOOL_VERSION_LEN: usize = 14;
const ENDIAN_LITTLE: u16 = 0xC0DE;
const ENDIAN_BIG: u16 = 0xDEC0;

/// Byte-per-block bitmap encoding id (the only mode this codec emits).
const BITMAP_MODE_BYTE: u8 = 2;

/// Size of the options record, counting the `feature_size` field itself.
const OPTIONS_SIZE: u32 = 17;

const ZSTD_MAGIC: [u8; 4] = [0x28, 0xB5, 0x2F, 0xFD];

/// On-disk format generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageVersion {
    /// "0001": no options record, implied crc32 / 4-byte tags / group 1.
    Legacy,
    /// "0002": explicit checksum options record.
    Current,
}

impl ImageVersion {
    pub fn tag(self) -> &'static [u8; 4] {
        match self {
            ImageVersion::Legacy => b"0001",
            ImageVersion::Current => b"0002",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ImageVersion::Legacy => "0001",
            ImageVersion::Current => "0002",
        }
    }
}

/// Checksum configuration carried in the "0002" options record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumOptions {
    pub mode: ChecksumMode,
    /// How many consecutive used blocks share one running-digest tag.
    pub blocks_per_group: u32,
    /// Width of the CPU that wrote the image. Informational; kept because a
    /// historical build derived its tag width from it.
    pub cpu_bits: u16,
}

impl Default for ChecksumOptions {
    fn default() -> Self {
        Self {
            mode: ChecksumMode::Crc32,
            blocks_per_group: 1,
            cpu_bits: 64,
        }
    }
}

impl ChecksumOptions {
    pub fn tag_size(&self) -> usize {
        self.mode.tag_size()
    }
}

/// Everything read from an image before the block stream begins.
#[derive(Debug, Clone)]
pub struct ImageHeader {
    pub version: ImageVersion,
    pub volume: VolumeInfo,
    pub options: ChecksumOptions,
}

fn write_padded(w: &mut impl Write, text: &str, len: usize) -> io::Result<()> {
    debug_assert!(text.len() <= len);
    let mut buf = vec![0u8; len];
    buf[..text.len()].copy_from_slice(text.as_bytes());
    w.write_all(&buf)
}

fn read_padded_string(r: &mut impl Read, len: usize) -> io::Result<String> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(String::from_utf8_lossy(&buf)
        .trim_end_matches('\0')
        .to_string())
}

/// Write the current-generation header: image head, volume info, options.
pub fn write_header(
    w: &mut impl Write,
    volume: &VolumeInfo,
    options: &ChecksumOptions,
) -> Result<(), ImageError> {
    volume.validate()?;

    // image head
    w.write_all(IMAGE_MAGIC)?;
    write_padded(w, env!("CARGO_PKG_VERSION"), TOOL_VERSION_LEN)?;
    w.write_all(ImageVersion::Current.tag())?;
    w.write_u16::<LittleEndian>(ENDIAN_LITTLE)?;

    // volume info
    write_padded(w, &volume.fs_tag, 16)?;
    w.write_u64::<LittleEndian>(volume.device_size)?;
    w.write_u64::<LittleEndian>(volume.total_blocks)?;
    w.write_u64::<LittleEndian>(volume.used_blocks)?;
    w.write_u32::<LittleEndian>(volume.block_size)?;

    // checksum options
    w.write_u32::<LittleEndian>(OPTIONS_SIZE)?;
    w.write_u16::<LittleEndian>(2)?; // image_version
    w.write_u16::<LittleEndian>(options.cpu_bits)?;
    w.write_u16::<LittleEndian>(options.mode.to_wire())?;
    w.write_u16::<LittleEndian>(options.mode.tag_size() as u16)?;
    w.write_u32::<LittleEndian>(options.blocks_per_group)?;
    w.write_u8(BITMAP_MODE_BYTE)?;

    Ok(())
}

/// Read and validate a header of either generation.
///
/// Distinguishes "not our format" ([`ImageError::BadMagic`]) from "ours but
/// unsupported" ([`ImageError::UnsupportedVersion`]).
pub fn read_header(r: &mut impl Read) -> Result<ImageHeader, ImageError> {
    let mut magic = [0u8; 16];
    r.read_exact(&mut magic)?;
    if &magic != IMAGE_MAGIC {
        return Err(ImageError::BadMagic);
    }

    let _tool_version = read_padded_string(r, TOOL_VERSION_LEN)?;

    let mut version_tag = [0u8; 4];
    r.read_exact(&mut version_tag)?;
    let version = match &version_tag {
        b"0001" => ImageVersion::Legacy,
        b"0002" => ImageVersion::Current,
        other => {
            return Err(ImageError::UnsupportedVersion(
                String::from_utf8_lossy(other).to_string(),
            ))
        }
    };

    let endian = r.read_u16::<LittleEndian>()?;
    match endian {
        ENDIAN_LITTLE => {}
        ENDIAN_BIG => return Err(ImageError::BigEndian),
        _ => return Err(ImageError::Desync("bad endianness marker")),
    }

    // volume info
    let fs_tag = read_padded_string(r, 16)?;
    let device_size = r.read_u64::<LittleEndian>()?;
    let total_blocks = r.read_u64::<LittleEndian>()?;
    let used_blocks = r.read_u64::<LittleEndian>()?;
    let block_size = r.read_u32::<LittleEndian>()?;

    let volume = VolumeInfo {
        fs_tag,
        block_size,
        total_blocks,
        used_blocks,
        device_size,
    };
    volume.validate()?;

    let options = match version {
        // "0001" has no options record; its values are hard-coded.
        ImageVersion::Legacy => ChecksumOptions {
            mode: ChecksumMode::Crc32,
            blocks_per_group: 1,
            cpu_bits: 32,
        },
        ImageVersion::Current => {
            let feature_size = r.read_u32::<LittleEndian>()?;
            if feature_size < OPTIONS_SIZE {
                return Err(ImageError::Desync("options record truncated"));
            }
            let _image_version = r.read_u16::<LittleEndian>()?;
            let cpu_bits = r.read_u16::<LittleEndian>()?;
            let mode = ChecksumMode::from_wire(r.read_u16::<LittleEndian>()?)?;
            let checksum_size = r.read_u16::<LittleEndian>()?;
            let blocks_per_group = r.read_u32::<LittleEndian>()?;
            let bitmap_mode = r.read_u8()?;

            if checksum_size as usize != mode.tag_size() {
                return Err(ImageError::BadTagSize {
                    mode: mode.as_str(),
                    size: checksum_size,
                    expected: mode.tag_size(),
                });
            }
            if bitmap_mode != BITMAP_MODE_BYTE {
                return Err(ImageError::Desync("unsupported bitmap encoding"));
            }
            if blocks_per_group == 0 {
                return Err(ImageError::Desync("blocks per checksum group is zero"));
            }

            // Skip extension fields a newer writer may have appended.
            let extra = (feature_size - OPTIONS_SIZE) as u64;
            if extra > 0 {
                io::copy(&mut r.take(extra), &mut io::sink())?;
            }

            ChecksumOptions {
                mode,
                blocks_per_group,
                cpu_bits,
            }
        }
    };

    Ok(ImageHeader {
        version,
        volume,
        options,
    })
}

/// Serialize the bitmap: leading marker, one byte per block, trailing marker.
pub fn write_bitmap(w: &mut impl Write, bitmap: &Bitmap) -> Result<(), ImageError> {
    w.write_all(BITMAP_MARKER)?;

    let total = bitmap.total_blocks();
    let mut chunk = [0u8; 8192];
    let mut index: u64 = 0;
    while index < total {
        let n = chunk.len().min((total - index) as usize);
        for (i, byte) in chunk[..n].iter_mut().enumerate() {
            *byte = bitmap.test(index + i as u64) as u8;
        }
        w.write_all(&chunk[..n])?;
        index += n as u64;
    }

    w.write_all(BITMAP_MARKER)?;
    Ok(())
}

/// Deserialize the bitmap, re-checking both alignment markers.
///
/// The trailing marker catches stream desynchronization before any block
/// data is consumed. The used-block count is cross-checked against the
/// header; a mismatch means a corrupt or foreign image and is fatal when
/// `strict` is set, otherwise logged.
pub fn read_bitmap(
    r: &mut impl Read,
    header: &ImageHeader,
    strict: bool,
) -> Result<Bitmap, ImageError> {
    let mut marker = [0u8; 8];
    r.read_exact(&mut marker)?;
    if &marker != BITMAP_MARKER {
        return Err(ImageError::Desync("missing bitmap marker"));
    }

    let total = header.volume.total_blocks;
    let mut bitmap = Bitmap::new(total)?;
    let mut chunk = [0u8; 8192];
    let mut index: u64 = 0;
    while index < total {
        let n = chunk.len().min((total - index) as usize);
        r.read_exact(&mut chunk[..n])?;
        for (i, &byte) in chunk[..n].iter().enumerate() {
            if byte != 0 {
                bitmap.set(index + i as u64);
            }
        }
        index += n as u64;
    }

    r.read_exact(&mut marker)?;
    if &marker != BITMAP_MARKER {
        return Err(ImageError::Desync("missing trailing bitmap marker"));
    }

    let counted = bitmap.count_used();
    if counted != header.volume.used_blocks {
        warn!(
            "bitmap contains {counted} used blocks but header declares {}",
            header.volume.used_blocks
        );
        if strict {
            return Err(ImageError::UsedCountMismatch {
                header: header.volume.used_blocks,
                bitmap: counted,
            });
        }
    }

    Ok(bitmap)
}

/// Sniff the stream for a zstd frame and stack a decoder if present.
///
/// Consumes the first four bytes either way; they are replayed through the
/// returned reader, so the caller sees the stream from offset zero.
pub fn maybe_decompress<'a, R: Read + 'a>(mut r: R) -> io::Result<Box<dyn Read + 'a>> {
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic)?;
    let replayed = io::Cursor::new(magic).chain(r);
    if magic == ZSTD_MAGIC {
        Ok(Box::new(zstd::stream::read::Decoder::new(replayed)?))
    } else {
        Ok(Box::new(replayed))
    }
}
