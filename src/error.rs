use thiserror::Error;

#[derive(Error, Debug)]
pub enum ImageError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("not a blockclone image (bad magic)")]
    BadMagic,

    #[error("unsupported image version: {0:?}")]
    UnsupportedVersion(String),

    #[error("big-endian images are not supported")]
    BigEndian,

    #[error("unknown checksum mode: {0}")]
    UnknownChecksumMode(u16),

    #[error("checksum tag size {size} does not match mode {mode} (expected {expected})")]
    BadTagSize {
        mode: &'static str,
        size: u16,
        expected: usize,
    },

    #[error("image stream desynchronized: {0}")]
    Desync(&'static str),

    #[error("checksum mismatch at block {block}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        block: u64,
        expected: String,
        actual: String,
    },

    #[error("insufficient target space: need {needed} bytes, have {available} bytes")]
    SizeMismatch { needed: u64, available: u64 },

    #[error("used-block count mismatch: header declares {header}, bitmap contains {bitmap}")]
    UsedCountMismatch { header: u64, bitmap: u64 },

    #[error("bitmap of {blocks} blocks overflows the addressable size")]
    BitmapTooLarge { blocks: u64 },

    #[error("size computation overflowed: {0}")]
    SizeOverflow(&'static str),

    #[error("invalid volume info: {0}")]
    InvalidVolume(String),
}
