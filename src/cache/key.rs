//! Deterministic mapping from logical cache keys to file and blob names

use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};

/// Extension given to every file-tier entry
pub const CACHE_FILE_EXTENSION: &str = "cache";

/// Upper bound on the length of a hashed name, before the extension
pub const MAX_HASHED_NAME_LEN: usize = 64;

/// Longest raw key used verbatim as a file name
const MAX_RAW_FILE_NAME_LEN: usize = 200;

/// Longest blob name accepted by the remote store
const MAX_BLOB_NAME_LEN: usize = 1024;

/// Characters rejected in file names on at least one supported filesystem
const INVALID_FILE_NAME_CHARS: &[char] = &['<', '>', ':', '"', '/', '\\', '|', '?', '*'];

/// Device names Windows reserves regardless of extension or case
const RESERVED_FILE_NAMES: &[&str] = &[
    "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7", "COM8",
    "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
];

fn is_reserved_file_name(key: &str) -> bool {
    let stem = key.split('.').next().unwrap_or(key).trim_end();
    RESERVED_FILE_NAMES
        .iter()
        .any(|reserved| stem.eq_ignore_ascii_case(reserved))
}

/// Maps cache keys to storage names.
///
/// Keys that are safe file names are used verbatim; anything else is replaced
/// by a hex SHA-256 digest capped at [`MAX_HASHED_NAME_LEN`] characters.
#[derive(Debug, Clone, Copy, Default)]
pub struct KeyCodec;

impl KeyCodec {
    /// Whether `key` can be used unchanged as a file name
    pub fn is_valid_file_name(key: &str) -> bool {
        !key.is_empty()
            && key.len() <= MAX_RAW_FILE_NAME_LEN
            && key != "."
            && key != ".."
            && !key.ends_with('.')
            && !key.ends_with(' ')
            && !is_reserved_file_name(key)
            && !key
                .chars()
                .any(|c| c.is_control() || INVALID_FILE_NAME_CHARS.contains(&c))
    }

    /// Sanitized, length-capped hash of a key
    pub fn hashed_name(key: &str) -> String {
        let digest = Sha256::digest(key.as_bytes());
        let mut name = hex::encode(digest);
        name.truncate(MAX_HASHED_NAME_LEN);
        name
    }

    /// File name (with extension) for a key
    pub fn file_name(key: &str) -> String {
        let stem = if Self::is_valid_file_name(key) {
            key.to_string()
        } else {
            Self::hashed_name(key)
        };
        format!("{}.{}", stem, CACHE_FILE_EXTENSION)
    }

    /// Absolute path of the cache file for `key` inside `dir`
    pub fn file_path(dir: &Path, key: &str) -> PathBuf {
        dir.join(Self::file_name(key))
    }

    /// Blob path for `key` under `prefix`
    pub fn blob_path(prefix: &str, key: &str) -> String {
        let prefix = prefix.trim_matches('/');
        let name = if Self::is_valid_blob_name(key) {
            key.trim_start_matches('/').to_string()
        } else {
            Self::hashed_name(key)
        };

        if prefix.is_empty() {
            name
        } else {
            format!("{}/{}", prefix, name)
        }
    }

    fn is_valid_blob_name(key: &str) -> bool {
        !key.trim_matches('/').is_empty()
            && key.len() <= MAX_BLOB_NAME_LEN
            && !key.ends_with('/')
            && !key.ends_with('.')
            && !key.chars().any(|c| c.is_control() || c == '\\')
    }
}
