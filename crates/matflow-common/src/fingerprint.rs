//! SHA-256 fingerprints for payloads and downloaded files

use crate::error::{MatflowError, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::Path;

/// Hex digest of raw bytes
pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Fingerprint of a serializable value.
///
/// `serde_json` maps serialize with sorted keys, so two payloads with equal
/// content always produce the same digest regardless of field order in the
/// source document.
pub fn json_fingerprint<T: Serialize + ?Sized>(value: &T) -> Result<String> {
    let canonical = serde_json::to_value(value)?;
    let bytes = serde_json::to_vec(&canonical)?;
    Ok(sha256_hex(&bytes))
}

/// Digest of anything readable, streamed in 64 KiB blocks
pub fn reader_fingerprint<R: Read>(reader: &mut R) -> Result<String> {
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }
    Ok(hex::encode(hasher.finalize()))
}

pub fn file_fingerprint(path: impl AsRef<Path>) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    reader_fingerprint(&mut file)
}

/// Compare a file against an expected digest
pub fn verify_file(path: impl AsRef<Path>, expected: &str) -> Result<()> {
    let actual = file_fingerprint(path)?;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(MatflowError::FingerprintMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::io::Write;

    #[test]
    fn test_sha256_known_vector() {
        assert_eq!(
            sha256_hex(b"hello world"),
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_json_fingerprint_ignores_key_order() {
        let a: serde_json::Value =
            serde_json::from_str(r#"{"formula":"NaCl","nsites":2}"#).unwrap();
        let b: serde_json::Value =
            serde_json::from_str(r#"{"nsites":2,"formula":"NaCl"}"#).unwrap();
        assert_eq!(json_fingerprint(&a).unwrap(), json_fingerprint(&b).unwrap());
        assert_ne!(
            json_fingerprint(&a).unwrap(),
            json_fingerprint(&json!({"formula": "KCl", "nsites": 2})).unwrap()
        );
    }

    #[test]
    fn test_verify_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"hello world").unwrap();
        file.flush().unwrap();

        verify_file(
            file.path(),
            "B94D27B9934D3E08A52E52D7DA7DABFAC484EFE37A5380EE9088F7ACE2EFCDE9",
        )
        .unwrap();
        assert!(matches!(
            verify_file(file.path(), "00"),
            Err(MatflowError::FingerprintMismatch { .. })
        ));
    }
}
