pub mod assembly;
pub mod block;
pub mod crc16;
pub mod ecc;
pub mod job;
pub mod printer;
pub mod scanner;
pub mod stream;

use std::{
    error::Error,
    fmt::{Debug, Display},
};

use bitflags::bitflags;

/// Dot grid side within one block; one block carries NDOT*NDOT = 1024 bits.
pub const NDOT: usize = 32;
/// Payload bytes per data block.
pub const NDATA: usize = 90;
/// Reed-Solomon parity bytes per block.
pub const ECC_SIZE: usize = 32;
/// Zero-padded name field in the superblock.
pub const FILENAME_SIZE: usize = 64;
/// Sentinel address marking a superblock.
pub const SUPERBLOCK: u32 = 0xFFFF_FFFF;
/// Redundancy group size bounds.
pub const NGROUPMIN: u32 = 2;
pub const NGROUPMAX: u32 = 10;
/// Maximum files being reassembled concurrently.
pub const NFILE: usize = 5;
/// Histogram length used by the peak finder.
pub const NHYST: usize = 1024;
/// Maximum peaks kept per histogram.
pub const NPEAK: usize = 32;
/// Composite grid sub-block side, in dots.
pub const SUBDX: usize = 8;
pub const SUBDY: usize = 8;

/// Bitmap dimension bounds accepted by the decoder.
pub const MIN_BITMAP_SIDE: usize = 128;
pub const MAX_BITMAP_SIDE: usize = 32768;

bitflags! {
    /// Special mode bits of the superblock.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct ModeFlags: u8 {
        const COMPRESSED = 0x01;
        const ENCRYPTED = 0x02;
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CodecError {
    InvalidParameter { name: &'static str, value: i64 },
    UnsupportedBitmap { width: usize, height: usize },
    GridNotFound,
    BadPassword,
    DecompressFailed,
    TooManyFiles,
    Cancelled,
}

impl Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::InvalidParameter { name, value } => {
                write!(f, "parameter {name} out of range: {value}")
            }
            CodecError::UnsupportedBitmap { width, height } => {
                write!(f, "unsupported bitmap dimensions {width}x{height}")
            }
            CodecError::GridNotFound => write!(f, "no dot grid found on page"),
            CodecError::BadPassword => write!(f, "invalid password or corrupted data"),
            CodecError::DecompressFailed => write!(f, "decompression failed"),
            CodecError::TooManyFiles => write!(f, "too many files in flight"),
            CodecError::Cancelled => write!(f, "job cancelled"),
        }
    }
}

impl Error for CodecError {}

/// Encoder options; see [`EncodeOptions::validate`] for the accepted ranges.
#[derive(Clone, Debug)]
pub struct EncodeOptions {
    /// Raster density, dots per inch.
    pub dpi: u32,
    /// Fraction of a cell filled by a dot mark, percent.
    pub dotpercent: u32,
    /// Data blocks per parity block.
    pub redundancy: u32,
    /// gzip level; 0 disables compression.
    pub compress: u32,
    /// Encrypt when set; PBKDF2-HMAC-SHA256 into AES-256-CBC.
    pub password: Option<String>,
    /// Draw a frame around the active area.
    pub printborder: bool,
    /// Paper size in 1/1000 inch; defaults are A4.
    pub paper_width1000: u32,
    pub paper_height1000: u32,
}

impl Default for EncodeOptions {
    fn default() -> Self {
        EncodeOptions {
            dpi: 200,
            dotpercent: 70,
            redundancy: 5,
            compress: 9,
            password: None,
            printborder: true,
            paper_width1000: 8270,
            paper_height1000: 11690,
        }
    }
}

impl EncodeOptions {
    pub fn validate(&self) -> Result<(), CodecError> {
        fn check(name: &'static str, value: u32, lo: u32, hi: u32) -> Result<(), CodecError> {
            if value < lo || value > hi {
                return Err(CodecError::InvalidParameter {
                    name,
                    value: value as i64,
                });
            }
            Ok(())
        }
        check("dpi", self.dpi, 40, 600)?;
        check("dotpercent", self.dotpercent, 50, 100)?;
        check("redundancy", self.redundancy, NGROUPMIN, NGROUPMAX)?;
        check("compress", self.compress, 0, 9)?;
        check("paper_width1000", self.paper_width1000, 1000, 100_000)?;
        check("paper_height1000", self.paper_height1000, 1000, 100_000)?;
        if let Some(password) = &self.password {
            if password.is_empty() {
                return Err(CodecError::InvalidParameter {
                    name: "password",
                    value: 0,
                });
            }
        }
        Ok(())
    }

    pub fn encrypted(&self) -> bool {
        self.password.is_some()
    }
}

/// 8-bit grayscale pixel buffer, row 0 at the top, 0 = black, 255 = white.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitmap {
    pub width: usize,
    pub height: usize,
    pub pixels: Vec<u8>,
}

impl Debug for Bitmap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bitmap")
            .field("width", &self.width)
            .field("height", &self.height)
            .finish()
    }
}

impl Bitmap {
    pub fn new(width: usize, height: usize, pixels: Vec<u8>) -> Result<Bitmap, CodecError> {
        if width < MIN_BITMAP_SIDE
            || width > MAX_BITMAP_SIDE
            || height < MIN_BITMAP_SIDE
            || height > MAX_BITMAP_SIDE
            || pixels.len() != width * height
        {
            return Err(CodecError::UnsupportedBitmap { width, height });
        }
        Ok(Bitmap {
            width,
            height,
            pixels,
        })
    }

    #[inline]
    pub fn pixel(&self, x: usize, y: usize) -> u8 {
        self.pixels[y * self.width + x]
    }
}

/// Milliseconds between 1601-01-01 (FILETIME epoch) and 1970-01-01 (Unix epoch).
const FILETIME_EPOCH_DELTA_MS: i64 = 11_644_473_600_000;

/// Unix milliseconds to Windows FILETIME (100-ns units since 1601-01-01).
pub fn to_filetime(mtime_ms: i64) -> u64 {
    (mtime_ms + FILETIME_EPOCH_DELTA_MS) as u64 * 10_000
}

/// Windows FILETIME back to Unix milliseconds.
pub fn from_filetime(filetime: u64) -> i64 {
    (filetime / 10_000) as i64 - FILETIME_EPOCH_DELTA_MS
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn filetime_roundtrip() {
        for ms in [0i64, 1, 1_700_000_000_000, 253_402_300_799_000] {
            assert_eq!(from_filetime(to_filetime(ms)), ms);
        }
    }

    #[test]
    fn options_ranges() {
        assert!(EncodeOptions::default().validate().is_ok());

        let mut opts = EncodeOptions::default();
        opts.dpi = 39;
        assert_eq!(
            opts.validate(),
            Err(CodecError::InvalidParameter {
                name: "dpi",
                value: 39
            })
        );

        let mut opts = EncodeOptions::default();
        opts.redundancy = 11;
        assert!(opts.validate().is_err());

        let mut opts = EncodeOptions::default();
        opts.dotpercent = 49;
        assert!(opts.validate().is_err());
    }

    #[test]
    fn bitmap_bounds() {
        assert!(Bitmap::new(128, 128, vec![255; 128 * 128]).is_ok());
        assert!(Bitmap::new(32768, 128, vec![255; 32768 * 128]).is_ok());
        assert!(Bitmap::new(127, 128, vec![255; 127 * 128]).is_err());
        assert!(Bitmap::new(32769, 128, vec![255; 32769 * 128]).is_err());
        // Pixel count must match the declared dimensions.
        assert!(Bitmap::new(128, 128, vec![255; 100]).is_err());
    }
}
