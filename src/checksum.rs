//! Running-digest checksums for the block stream.
//!
//! The stream carries one tag per checksum group (a run of
//! `blocks_per_group` used blocks). The accumulator is seeded once at
//! stream start and never re-seeded between groups: every emitted tag is
//! the digest of the state carried over from all prior groups. Verifying
//! group k therefore requires having processed groups 1..k-1 in order.

use xxhash_rust::xxh64::Xxh64;

use crate::error::ImageError;

/// Largest tag any mode emits (hash64).
pub const MAX_TAG_SIZE: usize = 8;

/// Checksum algorithm selector, as stored in the container options record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    /// No checksums; tag size 0.
    None,
    /// Reflected CRC-32, seed `0xFFFF_FFFF`, 4-byte little-endian tag.
    ///
    /// The final state is deliberately NOT inverted (textbook CRC-32
    /// complements it); existing images carry the raw state, so the
    /// non-inverted variant is wire-mandated.
    Crc32,
    /// Same table and seed as `Crc32`, but the update loop reads the first
    /// input byte for every position — a preserved bug from a historical
    /// build. Exists only so restore can detect and recover images written
    /// by that build; new images must never use it.
    Crc32Legacy,
    /// Streaming 64-bit hash (xxh64), seed 0, 8-byte little-endian tag.
    Hash64,
}

impl ChecksumMode {
    /// Parse the on-disk mode id. Unknown ids are a fatal configuration
    /// error at parse time, not deferred to first update.
    pub fn from_wire(id: u16) -> Result<Self, ImageError> {
        match id {
            0 => Ok(ChecksumMode::None),
            1 => Ok(ChecksumMode::Crc32),
            2 => Ok(ChecksumMode::Crc32Legacy),
            3 => Ok(ChecksumMode::Hash64),
            other => Err(ImageError::UnknownChecksumMode(other)),
        }
    }

    pub fn to_wire(self) -> u16 {
        match self {
            ChecksumMode::None => 0,
            ChecksumMode::Crc32 => 1,
            ChecksumMode::Crc32Legacy => 2,
            ChecksumMode::Hash64 => 3,
        }
    }

    /// Size in bytes of the tag this mode emits per group.
    pub fn tag_size(self) -> usize {
        match self {
            ChecksumMode::None => 0,
            ChecksumMode::Crc32 | ChecksumMode::Crc32Legacy => 4,
            ChecksumMode::Hash64 => 8,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ChecksumMode::None => "none",
            ChecksumMode::Crc32 => "crc32",
            ChecksumMode::Crc32Legacy => "crc32-legacy",
            ChecksumMode::Hash64 => "hash64",
        }
    }
}

/// Reflected CRC-32 table for polynomial 0xEDB88320.
static CRC32_TABLE: [u32; 256] = crc32_table();

const fn crc32_table() -> [u32; 256] {
    let mut table = [0u32; 256];
    let mut i = 0;
    while i < 256 {
        let mut c = i as u32;
        let mut bit = 0;
        while bit < 8 {
            c = if c & 1 != 0 {
                0xEDB8_8320 ^ (c >> 1)
            } else {
                c >> 1
            };
            bit += 1;
        }
        table[i] = c;
        i += 1;
    }
    table
}

#[inline]
fn crc32_step(state: u32, byte: u8) -> u32 {
    CRC32_TABLE[((state ^ byte as u32) & 0xFF) as usize] ^ (state >> 8)
}

/// A group tag: up to [`MAX_TAG_SIZE`] bytes. Unused trailing bytes are zero.
#[derive(Debug, Clone, Copy)]
pub struct Tag {
    bytes: [u8; MAX_TAG_SIZE],
    len: usize,
}

impl Tag {
    pub fn from_slice(bytes: &[u8]) -> Self {
        assert!(bytes.len() <= MAX_TAG_SIZE, "tag larger than {MAX_TAG_SIZE}");
        let mut buf = [0u8; MAX_TAG_SIZE];
        buf[..bytes.len()].copy_from_slice(bytes);
        Self {
            bytes: buf,
            len: bytes.len(),
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Hex rendering for log and error messages.
    pub fn to_hex(&self) -> String {
        let mut out = String::with_capacity(self.len * 2);
        for b in self.as_bytes() {
            out.push_str(&format!("{b:02x}"));
        }
        out
    }
}

impl PartialEq for Tag {
    fn eq(&self, other: &Self) -> bool {
        self.as_bytes() == other.as_bytes()
    }
}

impl Eq for Tag {}

/// Streaming checksum state. Cloning snapshots the accumulator, which the
/// restore engine uses to rewind one block during legacy-shift recovery.
#[derive(Clone)]
pub enum Checksum {
    None,
    Crc32 { state: u32 },
    Crc32Legacy { state: u32 },
    Hash64(Xxh64),
}

impl Checksum {
    /// Seed a fresh accumulator for `mode`. Called exactly once per stream.
    pub fn new(mode: ChecksumMode) -> Self {
        match mode {
            ChecksumMode::None => Checksum::None,
            ChecksumMode::Crc32 => Checksum::Crc32 {
                state: 0xFFFF_FFFF,
            },
            ChecksumMode::Crc32Legacy => Checksum::Crc32Legacy {
                state: 0xFFFF_FFFF,
            },
            ChecksumMode::Hash64 => Checksum::Hash64(Xxh64::new(0)),
        }
    }

    pub fn mode(&self) -> ChecksumMode {
        match self {
            Checksum::None => ChecksumMode::None,
            Checksum::Crc32 { .. } => ChecksumMode::Crc32,
            Checksum::Crc32Legacy { .. } => ChecksumMode::Crc32Legacy,
            Checksum::Hash64(_) => ChecksumMode::Hash64,
        }
    }

    pub fn tag_size(&self) -> usize {
        self.mode().tag_size()
    }

    /// Fold `data` into the running state.
    pub fn update(&mut self, data: &[u8]) {
        match self {
            Checksum::None => {}
            Checksum::Crc32 { state } => {
                for &b in data {
                    *state = crc32_step(*state, b);
                }
            }
            Checksum::Crc32Legacy { state } => {
                // The historical loop never advanced the input pointer:
                // every position folds in byte 0.
                if let Some(&first) = data.first() {
                    for _ in 0..data.len() {
                        *state = crc32_step(*state, first);
                    }
                }
            }
            Checksum::Hash64(h) => h.update(data),
        }
    }

    /// Snapshot the current tag without disturbing the running state.
    pub fn tag(&self) -> Tag {
        match self {
            Checksum::None => Tag::from_slice(&[]),
            Checksum::Crc32 { state } | Checksum::Crc32Legacy { state } => {
                Tag::from_slice(&state.to_le_bytes())
            }
            Checksum::Hash64(h) => Tag::from_slice(&h.digest().to_le_bytes()),
        }
    }
}
