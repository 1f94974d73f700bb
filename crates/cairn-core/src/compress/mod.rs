use std::io::{Read, Write};

use serde::{Deserialize, Serialize};

use crate::error::{CairnError, Result};

/// Maximum decompressed output size (32 MiB = 4x max chunk size).
/// Prevents decompression bombs from consuming unbounded memory.
const MAX_DECOMPRESS_SIZE: u64 = 32 * 1024 * 1024;

/// Named byte-stream codecs. The repository configuration records the
/// codec **name**; there is no per-blob tag, so decode always goes through
/// the configured codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Compression {
    /// Identity codec.
    None,
    #[default]
    Lz4,
    Gzip,
}

impl Compression {
    /// Resolve the configured name (`None` in CONFIG means identity).
    pub fn lookup(name: Option<&str>) -> Result<Self> {
        match name {
            None | Some("none") => Ok(Compression::None),
            Some("lz4") => Ok(Compression::Lz4),
            Some("gzip") => Ok(Compression::Gzip),
            Some(other) => Err(CairnError::UnsupportedCompression(other.to_string())),
        }
    }

    pub fn name(&self) -> Option<&'static str> {
        match self {
            Compression::None => None,
            Compression::Lz4 => Some("lz4"),
            Compression::Gzip => Some("gzip"),
        }
    }
}

/// Compress a byte slice with the given codec.
pub fn compress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        Compression::Gzip => {
            let mut encoder =
                flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(|e| CairnError::Codec {
                name: "gzip",
                message: e.to_string(),
            })?;
            encoder.finish().map_err(|e| CairnError::Codec {
                name: "gzip",
                message: e.to_string(),
            })
        }
    }
}

/// Decompress a byte slice produced by `compress` with the same codec.
pub fn decompress(compression: Compression, data: &[u8]) -> Result<Vec<u8>> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Lz4 => {
            if data.len() < 4 {
                return Err(CairnError::Codec {
                    name: "lz4",
                    message: "payload too short".into(),
                });
            }
            let uncompressed_size = u32::from_le_bytes(data[..4].try_into().unwrap()) as u64;
            if uncompressed_size > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Codec {
                    name: "lz4",
                    message: format!(
                        "decompressed size ({uncompressed_size}) exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                    ),
                });
            }
            lz4_flex::decompress_size_prepended(data).map_err(|e| CairnError::Codec {
                name: "lz4",
                message: e.to_string(),
            })
        }
        Compression::Gzip => {
            let decoder = flate2::read::GzDecoder::new(data);
            let mut output = Vec::new();
            decoder
                .take(MAX_DECOMPRESS_SIZE + 1)
                .read_to_end(&mut output)
                .map_err(|e| CairnError::Codec {
                    name: "gzip",
                    message: e.to_string(),
                })?;
            if output.len() as u64 > MAX_DECOMPRESS_SIZE {
                return Err(CairnError::Codec {
                    name: "gzip",
                    message: format!(
                        "decompressed size exceeds limit of {MAX_DECOMPRESS_SIZE} bytes"
                    ),
                });
            }
            Ok(output)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lookup_names() {
        assert_eq!(Compression::lookup(None).unwrap(), Compression::None);
        assert_eq!(
            Compression::lookup(Some("none")).unwrap(),
            Compression::None
        );
        assert_eq!(Compression::lookup(Some("lz4")).unwrap(), Compression::Lz4);
        assert_eq!(
            Compression::lookup(Some("gzip")).unwrap(),
            Compression::Gzip
        );
        assert!(matches!(
            Compression::lookup(Some("zstd")),
            Err(CairnError::UnsupportedCompression(_))
        ));
    }

    #[test]
    fn roundtrip_all_codecs() {
        let payloads: &[&[u8]] = &[b"", b"short", b"a longer payload that should compress fine"];
        for codec in [Compression::None, Compression::Lz4, Compression::Gzip] {
            for payload in payloads {
                let encoded = compress(codec, payload).unwrap();
                let decoded = decompress(codec, &encoded).unwrap();
                assert_eq!(&decoded, payload, "codec {codec:?}");
            }
        }
    }

    #[test]
    fn lz4_rejects_bomb() {
        // Huge size prefix (1 GiB) with tiny compressed data.
        let mut bomb = (1u32 << 30).to_le_bytes().to_vec();
        bomb.extend_from_slice(&[0u8; 10]);
        assert!(decompress(Compression::Lz4, &bomb).is_err());
    }

    #[test]
    fn lz4_rejects_short_payload() {
        assert!(decompress(Compression::Lz4, &[0x00, 0x00]).is_err());
    }

    #[test]
    fn gzip_rejects_garbage() {
        let err = decompress(Compression::Gzip, b"not gzip at all").unwrap_err();
        assert!(matches!(err, CairnError::Codec { name: "gzip", .. }));
    }

    #[test]
    fn lz4_compresses_repetitive_data() {
        let payload = vec![0xAA; 1024 * 1024];
        let encoded = compress(Compression::Lz4, &payload).unwrap();
        assert!(encoded.len() < payload.len() / 10);
        assert_eq!(decompress(Compression::Lz4, &encoded).unwrap(), payload);
    }
}
