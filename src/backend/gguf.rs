//! GGUF header checks
//!
//! Cheap sanity check run before handing a path to the native loader, so a
//! truncated or foreign file fails with a readable message instead of an
//! engine assertion. Model weights and LoRA adapters share the container.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: usize = 24;

const SUPPORTED_VERSIONS: std::ops::RangeInclusive<u32> = 2..=3;

#[derive(Debug, Error)]
pub enum GgufError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("not a GGUF file (magic 0x{0:08X})")]
    InvalidMagic(u32),

    #[error("unsupported GGUF version {0}")]
    UnsupportedVersion(u32),

    #[error("file too small to be GGUF ({0} header bytes)")]
    Truncated(usize),
}

/// Fixed-size prefix of a GGUF file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GgufHeader {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
}

impl GgufHeader {
    /// Parses the header from the start of `reader`.
    pub fn read_from<R: Read>(reader: R) -> Result<Self, GgufError> {
        let mut raw = [0u8; HEADER_LEN];
        let filled = read_up_to(reader, &mut raw).map_err(|source| GgufError::Io {
            path: "<reader>".to_string(),
            source,
        })?;
        if filled < HEADER_LEN {
            return Err(GgufError::Truncated(filled));
        }

        let word = |at: usize| u32::from_le_bytes([raw[at], raw[at + 1], raw[at + 2], raw[at + 3]]);
        let dword = |at: usize| {
            let mut b = [0u8; 8];
            b.copy_from_slice(&raw[at..at + 8]);
            u64::from_le_bytes(b)
        };

        let magic = word(0);
        if magic != GGUF_MAGIC {
            return Err(GgufError::InvalidMagic(magic));
        }
        let version = word(4);
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(GgufError::UnsupportedVersion(version));
        }

        Ok(Self {
            version,
            tensor_count: dword(8),
            metadata_kv_count: dword(16),
        })
    }

    /// Opens `path` and parses its header.
    pub fn read_path(path: &Path) -> Result<Self, GgufError> {
        let file = File::open(path).map_err(|source| GgufError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::read_from(BufReader::new(file)).map_err(|e| match e {
            GgufError::Io { source, .. } => GgufError::Io {
                path: path.display().to_string(),
                source,
            },
            other => other,
        })
    }
}

/// Like `read_exact`, but reports a short read instead of failing on it.
fn read_up_to<R: Read>(mut reader: R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

#[cfg(test)]
pub(crate) fn header_bytes(magic: u32, version: u32, tensors: u64, kvs: u64) -> Vec<u8> {
    let mut out = Vec::with_capacity(HEADER_LEN);
    out.extend_from_slice(&magic.to_le_bytes());
    out.extend_from_slice(&version.to_le_bytes());
    out.extend_from_slice(&tensors.to_le_bytes());
    out.extend_from_slice(&kvs.to_le_bytes());
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_valid_header_from_file() {
        let mut file = tempfile::Builder::new().suffix(".bin").tempfile().unwrap();
        file.write_all(&header_bytes(GGUF_MAGIC, 3, 291, 24)).unwrap();
        file.write_all(&[0u8; 64]).unwrap();
        file.flush().unwrap();

        let header = GgufHeader::read_path(file.path()).unwrap();
        assert_eq!(header.version, 3);
        assert_eq!(header.tensor_count, 291);
        assert_eq!(header.metadata_kv_count, 24);
    }

    #[test]
    fn test_wrong_magic() {
        let bytes = header_bytes(0xDEAD_BEEF, 3, 1, 1);
        let result = GgufHeader::read_from(bytes.as_slice());
        assert!(matches!(result, Err(GgufError::InvalidMagic(0xDEAD_BEEF))));
    }

    #[test]
    fn test_version_one_rejected() {
        let bytes = header_bytes(GGUF_MAGIC, 1, 1, 1);
        let result = GgufHeader::read_from(bytes.as_slice());
        assert!(matches!(result, Err(GgufError::UnsupportedVersion(1))));
    }

    #[test]
    fn test_truncated_header() {
        let bytes = GGUF_MAGIC.to_le_bytes();
        let result = GgufHeader::read_from(&bytes[..]);
        assert!(matches!(result, Err(GgufError::Truncated(4))));
    }

    #[test]
    fn test_missing_file_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.gguf");
        let err = GgufHeader::read_path(&path).unwrap_err();
        assert!(err.to_string().contains("absent.gguf"));
    }
}
