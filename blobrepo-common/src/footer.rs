//! Trailing checksum record of an index file.
//!
//! Layout (big-endian): magic `u32`, algorithm id `u32`, checksum `u64`.
//! The checksum is CRC-32 over every byte before the checksum field,
//! magic and algorithm id included.

use crc32fast::Hasher;

pub const FOOTER_MAGIC: u32 = !0x3fd7_6c17;
pub const ALGORITHM_CRC32: u32 = 0;
pub const FOOTER_LENGTH: u64 = 16;

/// Bytes of the footer that are covered by its own checksum.
pub const CHECKSUMMED_FOOTER_PREFIX: usize = 8;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum FooterError {
    #[error("footer must be 16 bytes, got {0}")]
    Length(usize),
    #[error("codec footer mismatch: actual footer={actual:#010x} vs expected footer=0xc02893e8")]
    Magic { actual: u32 },
    #[error("unknown checksum algorithm: {0}")]
    Algorithm(u32),
    #[error("illegal CRC-32 checksum: {0}")]
    IllegalChecksum(u64),
    #[error("checksum failed: expected={expected:#x} actual={actual:#x}")]
    Mismatch { expected: u64, actual: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChecksumFooter {
    pub algorithm_id: u32,
    pub checksum: u64,
}

impl ChecksumFooter {
    pub fn crc32(checksum: u32) -> Self {
        Self {
            algorithm_id: ALGORITHM_CRC32,
            checksum: u64::from(checksum),
        }
    }

    /// Footer for a file whose content before the footer is `body`.
    pub fn for_body(body: &[u8]) -> Self {
        let mut hasher = Hasher::new();
        hasher.update(body);
        hasher.update(&Self::checksummed_prefix());
        Self::crc32(hasher.finalize())
    }

    /// The magic and algorithm id bytes every CRC-32 footer starts with.
    pub fn checksummed_prefix() -> [u8; CHECKSUMMED_FOOTER_PREFIX] {
        let mut out = [0u8; CHECKSUMMED_FOOTER_PREFIX];
        out[..4].copy_from_slice(&FOOTER_MAGIC.to_be_bytes());
        out[4..].copy_from_slice(&ALGORITHM_CRC32.to_be_bytes());
        out
    }

    pub fn encode(&self) -> [u8; FOOTER_LENGTH as usize] {
        let mut out = [0u8; FOOTER_LENGTH as usize];
        out[..4].copy_from_slice(&FOOTER_MAGIC.to_be_bytes());
        out[4..8].copy_from_slice(&self.algorithm_id.to_be_bytes());
        out[8..].copy_from_slice(&self.checksum.to_be_bytes());
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, FooterError> {
        let bytes: &[u8; FOOTER_LENGTH as usize] =
            bytes.try_into().map_err(|_| FooterError::Length(bytes.len()))?;

        let magic = u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
        if magic != FOOTER_MAGIC {
            return Err(FooterError::Magic { actual: magic });
        }
        let algorithm_id = u32::from_be_bytes([bytes[4], bytes[5], bytes[6], bytes[7]]);
        if algorithm_id != ALGORITHM_CRC32 {
            return Err(FooterError::Algorithm(algorithm_id));
        }
        let mut checksum = [0u8; 8];
        checksum.copy_from_slice(&bytes[8..]);
        let checksum = u64::from_be_bytes(checksum);
        if checksum >> 32 != 0 {
            return Err(FooterError::IllegalChecksum(checksum));
        }

        Ok(Self {
            algorithm_id,
            checksum,
        })
    }

    /// Compare against a checksum computed over the preceding bytes.
    pub fn verify(&self, actual: u64) -> Result<(), FooterError> {
        if self.checksum == actual {
            Ok(())
        } else {
            Err(FooterError::Mismatch {
                expected: self.checksum,
                actual,
            })
        }
    }
}

/// `body` followed by its footer, i.e. a complete index file.
pub fn seal(body: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(body.len() + FOOTER_LENGTH as usize);
    out.extend_from_slice(body);
    out.extend_from_slice(&ChecksumFooter::for_body(body).encode());
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_magic_constant() {
        assert_eq!(FOOTER_MAGIC, 0xc028_93e8);
    }

    #[test]
    fn test_encode_layout() {
        let bytes = ChecksumFooter::crc32(0xdead_beef).encode();
        assert_eq!(&bytes[..4], &[0xc0, 0x28, 0x93, 0xe8]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, 0]);
        assert_eq!(&bytes[8..], &[0, 0, 0, 0, 0xde, 0xad, 0xbe, 0xef]);
        assert_eq!(ChecksumFooter::decode(&bytes).unwrap().checksum, 0xdead_beef);
    }

    #[test]
    fn test_sealed_file_checksum_covers_prefix() {
        let file = seal(b"segment data");
        let split = file.len() - 8;
        let footer = ChecksumFooter::decode(&file[file.len() - 16..]).unwrap();
        footer
            .verify(u64::from(crc32fast::hash(&file[..split])))
            .unwrap();
    }

    #[test]
    fn test_decode_rejects_bad_footers() {
        let good = ChecksumFooter::crc32(7).encode();

        assert_eq!(ChecksumFooter::decode(&good[..15]), Err(FooterError::Length(15)));

        let mut bad_magic = good;
        bad_magic[0] = 0;
        assert!(matches!(
            ChecksumFooter::decode(&bad_magic),
            Err(FooterError::Magic { .. })
        ));

        let mut bad_algorithm = good;
        bad_algorithm[7] = 1;
        assert_eq!(ChecksumFooter::decode(&bad_algorithm), Err(FooterError::Algorithm(1)));

        let mut wide = good;
        wide[8] = 1;
        assert!(matches!(
            ChecksumFooter::decode(&wide),
            Err(FooterError::IllegalChecksum(_))
        ));
    }

    #[test]
    fn test_verify_mismatch() {
        let footer = ChecksumFooter::crc32(1);
        assert_eq!(
            footer.verify(2),
            Err(FooterError::Mismatch { expected: 1, actual: 2 })
        );
    }
}
