//! Iris File Extension header parsing and emission.
//!
//! # Header layout (32 bytes, little-endian)
//!
//! ```text
//! Bytes  0-7:  Magic tag "IRISCDC\0"
//! Bytes  8-19: Version (major u32, minor u32, build u32)
//! Bytes 20-27: Absolute byte offset of the root directory (u64)
//! Bytes 28-31: Flags (reserved, zero)
//! ```
//!
//! A root-directory offset of zero marks a file whose directory has not been
//! published yet (an encoder died mid-write); such a file never validates.

use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::error::{ContainerError, IrisError, Result};
use crate::types::{Version, CODEC_VERSION};

/// Magic tag at the start of every Iris Codec file.
pub const MAGIC: [u8; 8] = *b"IRISCDC\0";

/// Size of the file header in bytes.
pub const HEADER_SIZE: usize = 32;

/// Byte offset of the root-directory offset field within the header.
pub const ROOT_OFFSET_FIELD: u64 = 20;

// =============================================================================
// FileHeader
// =============================================================================

/// Parsed file header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FileHeader {
    /// Version of the codec that wrote the file.
    pub version: Version,

    /// Absolute offset of the root directory; zero if unpublished.
    pub root_offset: u64,

    /// Reserved flag bits.
    pub flags: u32,
}

impl FileHeader {
    /// Parse a header from the first bytes of a file.
    ///
    /// Checks the magic tag and that the file's version does not postdate
    /// this codec. The root offset is *not* range-checked here; callers
    /// validate it against the file length.
    pub fn parse(bytes: &[u8]) -> Result<Self, ContainerError> {
        if bytes.len() < HEADER_SIZE {
            return Err(ContainerError::Truncated {
                offset: 0,
                required: HEADER_SIZE as u64,
                actual: bytes.len() as u64,
            });
        }
        if bytes[..8] != MAGIC {
            return Err(ContainerError::BadMagic);
        }

        let version = Version {
            major: u32::from_le_bytes(bytes[8..12].try_into().unwrap()),
            minor: u32::from_le_bytes(bytes[12..16].try_into().unwrap()),
            build: u32::from_le_bytes(bytes[16..20].try_into().unwrap()),
        };
        if version > CODEC_VERSION {
            return Err(ContainerError::VersionAhead {
                file: version.to_string(),
                codec: CODEC_VERSION.to_string(),
            });
        }

        Ok(FileHeader {
            version,
            root_offset: u64::from_le_bytes(bytes[20..28].try_into().unwrap()),
            flags: u32::from_le_bytes(bytes[28..32].try_into().unwrap()),
        })
    }

    /// Emit the 32-byte header.
    pub fn encode(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[..8].copy_from_slice(&MAGIC);
        out[8..12].copy_from_slice(&self.version.major.to_le_bytes());
        out[12..16].copy_from_slice(&self.version.minor.to_le_bytes());
        out[16..20].copy_from_slice(&self.version.build.to_le_bytes());
        out[20..28].copy_from_slice(&self.root_offset.to_le_bytes());
        out[28..32].copy_from_slice(&self.flags.to_le_bytes());
        out
    }

    /// Header for a freshly created file whose directory is still pending.
    pub fn unpublished() -> Self {
        FileHeader {
            version: CODEC_VERSION,
            root_offset: 0,
            flags: 0,
        }
    }
}

// =============================================================================
// File signature check
// =============================================================================

/// Check whether `path` carries an Iris Codec file signature.
///
/// Opens the file and inspects only the header: magic tag present and file
/// version no newer than this codec. The directory is not parsed; use
/// [`crate::container::validate_slide`] for a full structural check.
pub fn is_iris_codec_file(path: impl AsRef<Path>) -> Result<bool> {
    let mut file = File::open(path.as_ref())?;
    let mut header = [0u8; HEADER_SIZE];
    match file.read_exact(&mut header) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(false),
        Err(e) => return Err(IrisError::Io(e)),
    }
    match FileHeader::parse(&header) {
        Ok(_) => Ok(true),
        Err(ContainerError::BadMagic) | Err(ContainerError::VersionAhead { .. }) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_parse_round_trip() {
        let header = FileHeader {
            version: Version::new(2025, 1, 0),
            root_offset: 0x1234_5678_9ABC,
            flags: 0,
        };
        let bytes = header.encode();
        assert_eq!(bytes.len(), HEADER_SIZE);
        assert_eq!(FileHeader::parse(&bytes).unwrap(), header);
    }

    #[test]
    fn test_magic_layout() {
        let bytes = FileHeader::unpublished().encode();
        assert_eq!(&bytes[..8], b"IRISCDC\0");
    }

    #[test]
    fn test_root_offset_at_byte_20() {
        let header = FileHeader {
            version: CODEC_VERSION,
            root_offset: 0x0102_0304_0506_0708,
            flags: 0,
        };
        let bytes = header.encode();
        assert_eq!(
            &bytes[ROOT_OFFSET_FIELD as usize..ROOT_OFFSET_FIELD as usize + 8],
            &[0x08, 0x07, 0x06, 0x05, 0x04, 0x03, 0x02, 0x01]
        );
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut bytes = FileHeader::unpublished().encode();
        bytes[0] = b'X';
        assert!(matches!(
            FileHeader::parse(&bytes),
            Err(ContainerError::BadMagic)
        ));
    }

    #[test]
    fn test_future_version_rejected() {
        let header = FileHeader {
            version: Version::new(CODEC_VERSION.major + 1, 0, 0),
            root_offset: 64,
            flags: 0,
        };
        let bytes = header.encode();
        assert!(matches!(
            FileHeader::parse(&bytes),
            Err(ContainerError::VersionAhead { .. })
        ));
    }

    #[test]
    fn test_older_version_accepted() {
        let header = FileHeader {
            version: Version::new(2024, 2, 7),
            root_offset: 64,
            flags: 0,
        };
        let parsed = FileHeader::parse(&header.encode()).unwrap();
        assert_eq!(parsed.version, Version::new(2024, 2, 7));
    }

    #[test]
    fn test_truncated_header_rejected() {
        let bytes = [0u8; 16];
        assert!(matches!(
            FileHeader::parse(&bytes),
            Err(ContainerError::Truncated { required: 32, .. })
        ));
    }

    #[test]
    fn test_is_iris_codec_file() {
        use std::io::Write;

        let dir = tempfile::tempdir().unwrap();

        let valid = dir.path().join("valid.iris");
        std::fs::File::create(&valid)
            .unwrap()
            .write_all(&FileHeader::unpublished().encode())
            .unwrap();
        assert!(is_iris_codec_file(&valid).unwrap());

        let bogus = dir.path().join("bogus.bin");
        std::fs::File::create(&bogus)
            .unwrap()
            .write_all(b"not a slide file at all")
            .unwrap();
        assert!(!is_iris_codec_file(&bogus).unwrap());

        let short = dir.path().join("short.bin");
        std::fs::File::create(&short)
            .unwrap()
            .write_all(b"IRIS")
            .unwrap();
        assert!(!is_iris_codec_file(&short).unwrap());
    }
}
