//! Sniffs the compression format of a byte stream from its magic number (or
//! a filename suffix when the stream is too short to carry one), then wraps
//! it in the matching decoder. The peeked bytes are spliced back in front of
//! the stream so nothing downstream notices the detector ever looked.

use std::io::{self, Cursor, Read};

use flate2::read::GzDecoder;
use lz4_flex::frame::FrameDecoder;

use crate::config::CompressionOverride;

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];
const LZ4_MAGIC: [u8; 4] = [0x04, 0x22, 0x4d, 0x18];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Raw,
    Gzip,
    Lz4,
}

pub struct CompressionDetector;

impl CompressionDetector {
    /// Detect and unwrap compression on `reader`. `filename_hint` (e.g. the
    /// last path segment of the source URL) is consulted only when the magic
    /// peek is inconclusive -- an object can be shorter than four bytes.
    pub fn detect(
        mut reader: Box<dyn Read + Send>,
        filename_hint: Option<&str>,
        override_: CompressionOverride,
    ) -> io::Result<(Compression, Box<dyn Read + Send>)> {
        let forced = match override_ {
            CompressionOverride::Gzip => Some(Compression::Gzip),
            CompressionOverride::Lz4 => Some(Compression::Lz4),
            CompressionOverride::Tar => Some(Compression::Raw),
            CompressionOverride::Auto => None,
        };
        if let Some(compression) = forced {
            let wrapped = wrap(compression, reader);
            return Ok((compression, wrapped));
        }

        let mut peeked = vec![0u8; 4];
        let n = read_fill(&mut reader, &mut peeked)?;
        peeked.truncate(n);

        let detected = if peeked.len() >= 2 && peeked[..2] == GZIP_MAGIC {
            Compression::Gzip
        } else if peeked.len() >= 4 && peeked[..4] == LZ4_MAGIC {
            Compression::Lz4
        } else {
            match filename_hint.map(suffix_guess) {
                Some(Some(c)) => c,
                _ => Compression::Raw,
            }
        };

        let spliced: Box<dyn Read + Send> = Box::new(Cursor::new(peeked).chain(reader));
        let wrapped = wrap(detected, spliced);
        Ok((detected, wrapped))
    }
}

fn suffix_guess(name: &str) -> Option<Compression> {
    let lower = name.to_ascii_lowercase();
    if lower.ends_with(".gz") || lower.ends_with(".tgz") {
        Some(Compression::Gzip)
    } else if lower.ends_with(".lz4") {
        Some(Compression::Lz4)
    } else {
        None
    }
}

fn wrap(compression: Compression, reader: Box<dyn Read + Send>) -> Box<dyn Read + Send> {
    match compression {
        Compression::Raw => reader,
        Compression::Gzip => Box::new(GzDecoder::new(reader)),
        Compression::Lz4 => Box::new(FrameDecoder::new(reader)),
    }
}

/// Read up to `buf.len()` bytes, looping on short reads, stopping early only
/// on EOF. Returns the number of bytes actually filled.
fn read_fill(reader: &mut dyn Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    #[test]
    fn detects_gzip_magic() {
        let data: Vec<u8> = vec![0x1f, 0x8b, 0x08, 0x00, 0xaa, 0xbb];
        let (c, _) = CompressionDetector::detect(Box::new(Cursor::new(data)), None, CompressionOverride::Auto).unwrap();
        assert_eq!(c, Compression::Gzip);
    }

    #[test]
    fn detects_lz4_magic() {
        let data: Vec<u8> = vec![0x04, 0x22, 0x4d, 0x18, 0x00];
        let (c, _) = CompressionDetector::detect(Box::new(Cursor::new(data)), None, CompressionOverride::Auto).unwrap();
        assert_eq!(c, Compression::Lz4);
    }

    #[test]
    fn falls_back_to_filename_suffix_on_short_stream() {
        let data: Vec<u8> = vec![0x01];
        let (c, _) = CompressionDetector::detect(
            Box::new(Cursor::new(data)),
            Some("archive.tar.gz"),
            CompressionOverride::Auto,
        )
        .unwrap();
        assert_eq!(c, Compression::Gzip);
    }

    #[test]
    fn raw_passthrough_preserves_bytes() {
        let data = b"plain tar bytes".to_vec();
        let (c, mut r) = CompressionDetector::detect(Box::new(Cursor::new(data.clone())), None, CompressionOverride::Auto).unwrap();
        assert_eq!(c, Compression::Raw);
        let mut out = Vec::new();
        r.read_to_end(&mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn override_bypasses_detection() {
        let data = b"\x1f\x8bnot actually read as gzip here".to_vec();
        let (c, _) = CompressionDetector::detect(Box::new(Cursor::new(data)), None, CompressionOverride::Tar).unwrap();
        assert_eq!(c, Compression::Raw);
    }
}
