//! EK-014: BLAKE3 fingerprints for catalogs and package batches.

use crate::core::error::{EngineError, Result};
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file.read(&mut buf).map_err(|e| EngineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a string. Returns `"blake3:{hex}"`.
pub fn hash_string(s: &str) -> String {
    format!("blake3:{}", blake3::hash(s.as_bytes()).to_hex())
}

/// Hash an ordered list of items; order is significant.
pub fn hash_items<S: AsRef<str>>(items: &[S]) -> String {
    let mut hasher = blake3::Hasher::new();
    for item in items {
        hasher.update(item.as_ref().as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ek014_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("catalog.json");
        std::fs::write(&path, "{}").unwrap();
        let h = hash_file(&path).unwrap();
        assert!(h.starts_with("blake3:"));
        assert_eq!(h.len(), 7 + 64);
        assert_eq!(h, hash_string("{}"));
    }

    #[test]
    fn test_ek014_hash_file_not_found() {
        let err = hash_file(Path::new("/nonexistent/catalog.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/catalog.json"));
    }

    #[test]
    fn test_ek014_hash_items_order_sensitive() {
        let a = hash_items(&["libX>=2.0", "numpy"]);
        let b = hash_items(&["numpy", "libX>=2.0"]);
        assert_ne!(a, b);
        assert_eq!(a, hash_items(&["libX>=2.0".to_string(), "numpy".to_string()]));
    }

    #[test]
    fn test_ek014_hash_items_separator() {
        // ["ab", "c"] must not collide with ["a", "bc"]
        assert_ne!(hash_items(&["ab", "c"]), hash_items(&["a", "bc"]));
    }
}
