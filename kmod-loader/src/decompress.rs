// Compressed module images (.ko.gz, .ko.xz, .ko.zst)

use flate2::read::MultiGzDecoder;
use std::io::{self, BufRead, Read};
use std::path::Path;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Compression {
    Gzip,
    Xz,
    Zstd,
}

impl Compression {
    /// Detect compression from the file extension
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|e| e.to_str()) {
            Some("gz") => Some(Compression::Gzip),
            Some("xz") => Some(Compression::Xz),
            Some("zst") => Some(Compression::Zstd),
            _ => None,
        }
    }
}

/// Decompress a whole module image into memory
pub fn decompress<R: BufRead>(compression: Compression, mut reader: R) -> io::Result<Vec<u8>> {
    let mut image = Vec::new();
    match compression {
        Compression::Gzip => {
            MultiGzDecoder::new(reader).read_to_end(&mut image)?;
        }
        Compression::Xz => {
            lzma_rs::xz_decompress(&mut reader, &mut image)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
        }
        Compression::Zstd => {
            zstd::stream::read::Decoder::with_buffer(reader)?.read_to_end(&mut image)?;
        }
    }
    Ok(image)
}
