//! Single-stream compression framings that wrap a payload or a tar stream.

use flate2::{GzBuilder, read::MultiGzDecoder};
use serde::Serialize;
use std::fmt;
use std::io::{Read, Write};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    Gzip,
    Bzip2,
    Xz,
    /// Recognized only; 7z archives pass through untouched.
    #[serde(rename = "7z")]
    SevenZip,
}

impl Codec {
    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Gzip => "gzip",
            Codec::Bzip2 => "bzip2",
            Codec::Xz => "xz",
            Codec::SevenZip => "7z",
        }
    }

    pub fn is_supported(&self) -> bool {
        !matches!(self, Codec::SevenZip)
    }
}

impl fmt::Display for Codec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Header fields of the original stream, restored when re-encoding.
#[derive(Debug, Clone, Default)]
pub struct Framing {
    gzip: Option<GzipHeader>,
}

#[derive(Debug, Clone, Default)]
struct GzipHeader {
    filename: Option<Vec<u8>>,
    comment: Option<Vec<u8>>,
    mtime: u32,
    os: u8,
}

/// Decompresses a complete stream, concatenated members included.
pub fn unwrap(codec: Codec, bytes: &[u8]) -> Result<(Vec<u8>, Framing)> {
    let mut out = Vec::with_capacity(bytes.len().saturating_mul(3));
    let mut framing = Framing::default();
    match codec {
        Codec::Gzip => {
            let mut decoder = MultiGzDecoder::new(bytes);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| Error::codec(codec, e))?;
            framing.gzip = decoder.header().map(|h| GzipHeader {
                filename: h.filename().map(<[u8]>::to_vec),
                comment: h.comment().map(<[u8]>::to_vec),
                mtime: h.mtime(),
                os: h.operating_system(),
            });
        }
        Codec::Bzip2 => {
            bzip2::read::MultiBzDecoder::new(bytes)
                .read_to_end(&mut out)
                .map_err(|e| Error::codec(codec, e))?;
        }
        Codec::Xz => {
            lzma_rust2::XzReader::new(bytes, true)
                .read_to_end(&mut out)
                .map_err(|e| Error::codec(codec, e))?;
        }
        Codec::SevenZip => return Err(unsupported(codec)),
    }
    Ok((out, framing))
}

/// Compresses `payload` with `codec`, restoring the recorded framing where the codec has one.
pub fn wrap(codec: Codec, payload: &[u8], framing: &Framing) -> Result<Vec<u8>> {
    let err = |e: std::io::Error| Error::codec(codec, e);
    match codec {
        Codec::Gzip => {
            let mut builder = GzBuilder::new();
            if let Some(h) = &framing.gzip {
                builder = builder.mtime(h.mtime).operating_system(h.os);
                if let Some(name) = &h.filename {
                    builder = builder.filename(name.clone());
                }
                if let Some(comment) = &h.comment {
                    builder = builder.comment(comment.clone());
                }
            }
            let mut encoder = builder.write(Vec::new(), flate2::Compression::default());
            encoder.write_all(payload).map_err(err)?;
            encoder.finish().map_err(err)
        }
        Codec::Bzip2 => {
            let mut encoder =
                bzip2::write::BzEncoder::new(Vec::new(), bzip2::Compression::default());
            encoder.write_all(payload).map_err(err)?;
            encoder.finish().map_err(err)
        }
        Codec::Xz => {
            let mut writer =
                lzma_rust2::XzWriter::new(Vec::new(), lzma_rust2::XzOptions::with_preset(6))
                    .map_err(err)?;
            writer.write_all(payload).map_err(err)?;
            writer.finish().map_err(err)
        }
        Codec::SevenZip => Err(unsupported(codec)),
    }
}

fn unsupported(codec: Codec) -> Error {
    Error::codec(
        codec,
        std::io::Error::new(std::io::ErrorKind::Unsupported, "codec is recognized but not rewritten"),
    )
}
