//! SHA-256 hashing over byte strings and files.

use crate::Error;
use serde::{Deserialize, Serialize};
use sha2::{Digest as _, Sha256};
use std::{
    fmt,
    fs::File,
    io::Read,
    path::Path,
    str::FromStr,
};
use thiserror::Error as ThisError;

/// Files are streamed through the hasher in chunks of this size.
const FILE_CHUNK_SIZE: usize = 4096;

/// A SHA-256 digest rendered as 64 lowercase hexadecimal characters.
///
/// Equality is byte-for-byte on the hex string; interior node hashes are
/// computed over the concatenation of two of these strings.
#[derive(Clone, Debug, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Digest(String);

impl Digest {
    fn from_output(output: impl AsRef<[u8]>) -> Self {
        Self(hex::encode(output))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, ThisError)]
#[error("`{0}` is not a 64-character lowercase hex SHA-256 digest")]
pub struct InvalidDigestError(String);

impl FromStr for Digest {
    type Err = InvalidDigestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.len() == 64 && s.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
            Ok(Self(s.to_string()))
        } else {
            Err(InvalidDigestError(s.to_string()))
        }
    }
}

/// Hashes a byte string, returning the digest as lowercase hex.
pub fn hash_bytes(bytes: impl AsRef<[u8]>) -> Digest {
    Digest::from_output(Sha256::digest(bytes.as_ref()))
}

/// Hashes a file by streaming its contents in 4 KiB chunks.
///
/// The file is hashed as-is; line endings are not canonicalized.
pub fn hash_file(path: impl AsRef<Path>) -> Result<Digest, Error> {
    let path = path.as_ref();
    let io_err = |source| Error::Io {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(io_err)?;
    let mut hasher = Sha256::new();
    let mut chunk = [0u8; FILE_CHUNK_SIZE];
    loop {
        let read = file.read(&mut chunk).map_err(io_err)?;
        if read == 0 {
            break;
        }
        hasher.update(&chunk[..read]);
    }

    Ok(Digest::from_output(hasher.finalize()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    // The NIST test vector for the empty message.
    const EMPTY_SHA256: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

    #[test]
    fn hashes_bytes_to_lowercase_hex() {
        assert_eq!(hash_bytes("").as_str(), EMPTY_SHA256);
        assert_eq!(
            hash_bytes("a").as_str(),
            "ca978112ca1bbdcafac231b39a23dc4da786eff8147c4e72b9807785afee48bb"
        );
    }

    #[test]
    fn file_hash_matches_byte_hash() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        // Larger than one chunk so the streaming path is exercised.
        let content = "x".repeat(FILE_CHUNK_SIZE * 3 + 17);
        file.write_all(content.as_bytes()).unwrap();

        assert_eq!(hash_file(file.path()).unwrap(), hash_bytes(&content));
    }

    #[test]
    fn missing_file_is_an_io_error() {
        let err = hash_file("/nonexistent/treesnap-test").unwrap_err();
        assert!(matches!(err, Error::Io { .. }));
    }

    #[test]
    fn digest_parsing_rejects_bad_input() {
        assert!(EMPTY_SHA256.parse::<Digest>().is_ok());
        assert!("abc".parse::<Digest>().is_err());
        assert!(EMPTY_SHA256.to_uppercase().parse::<Digest>().is_err());
    }
}
