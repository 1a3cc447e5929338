//! gzip / deflate payload coding.

use flate2::read::{DeflateDecoder, GzDecoder, ZlibDecoder};
use flate2::write::{GzEncoder, ZlibEncoder};
use flate2::Compression;
use std::io::{self, Read, Write};

/// A `Content-Encoding` this crate understands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Encoding {
    Gzip,
    /// zlib-wrapped deflate as sent by most servers; raw deflate streams are accepted on decode.
    Deflate,
    Identity,
}

impl Encoding {
    /// Map a `Content-Encoding` header value. `None` means an encoding we cannot decode.
    pub fn from_header(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "gzip" | "x-gzip" => Some(Encoding::Gzip),
            "deflate" => Some(Encoding::Deflate),
            "" | "identity" => Some(Encoding::Identity),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Encoding::Gzip => "gzip",
            Encoding::Deflate => "deflate",
            Encoding::Identity => "identity",
        }
    }
}

/// Compress `data`. `level` is clamped to 0..=9.
pub fn compress(data: &[u8], encoding: Encoding, level: u32) -> io::Result<Vec<u8>> {
    let level = Compression::new(level.min(9));
    match encoding {
        Encoding::Gzip => {
            let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Deflate => {
            let mut encoder = ZlibEncoder::new(Vec::with_capacity(data.len() / 2), level);
            encoder.write_all(data)?;
            encoder.finish()
        }
        Encoding::Identity => Ok(data.to_vec()),
    }
}

pub fn decompress(data: &[u8], encoding: Encoding) -> io::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len().saturating_mul(3));
    match encoding {
        Encoding::Gzip => {
            GzDecoder::new(data).read_to_end(&mut out)?;
        }
        Encoding::Deflate => {
            if ZlibDecoder::new(data).read_to_end(&mut out).is_err() {
                out.clear();
                DeflateDecoder::new(data).read_to_end(&mut out)?;
            }
        }
        Encoding::Identity => out.extend_from_slice(data),
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &[u8] = b"<html><body>release notes release notes release notes</body></html>";

    #[test]
    fn header_values() {
        assert_eq!(Encoding::from_header("gzip"), Some(Encoding::Gzip));
        assert_eq!(Encoding::from_header(" Deflate "), Some(Encoding::Deflate));
        assert_eq!(Encoding::from_header("identity"), Some(Encoding::Identity));
        assert_eq!(Encoding::from_header("br"), None);
    }

    #[test]
    fn gzip_roundtrip() {
        let packed = compress(SAMPLE, Encoding::Gzip, 6).unwrap();
        assert_eq!(&packed[..2], &[0x1f, 0x8b]);
        assert_eq!(decompress(&packed, Encoding::Gzip).unwrap(), SAMPLE);
    }

    #[test]
    fn deflate_accepts_raw_streams() {
        let mut encoder = flate2::write::DeflateEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(SAMPLE).unwrap();
        let raw = encoder.finish().unwrap();
        assert_eq!(decompress(&raw, Encoding::Deflate).unwrap(), SAMPLE);

        let zlib = compress(SAMPLE, Encoding::Deflate, 9).unwrap();
        assert_eq!(decompress(&zlib, Encoding::Deflate).unwrap(), SAMPLE);
    }

    #[test]
    fn garbage_is_an_error() {
        assert!(decompress(b"definitely not gzip", Encoding::Gzip).is_err());
    }
}
