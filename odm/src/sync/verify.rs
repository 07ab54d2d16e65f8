use std::io;
use std::path::Path;
use std::str::FromStr;

use odm_core::quickxor::hash_file;
use thiserror::Error;
use tracing::{debug, info};

use crate::snapshot::Item;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DiffScope {
    pub size: bool,
    pub hash: bool,
}

#[derive(Debug, Error)]
#[error("unknown diff attribute {0:?}, expected size or hash")]
pub struct DiffScopeError(String);

impl Default for DiffScope {
    fn default() -> Self {
        Self {
            size: true,
            hash: true,
        }
    }
}

impl FromStr for DiffScope {
    type Err = DiffScopeError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let mut scope = Self {
            size: false,
            hash: false,
        };
        for token in value.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "size" => scope.size = true,
                "hash" => scope.hash = true,
                other => return Err(DiffScopeError(other.to_string())),
            }
        }
        Ok(scope)
    }
}

impl DiffScope {
    pub fn expected<'a>(&self, item: &'a Item) -> Expected<'a> {
        Expected {
            size: if self.size { item.size } else { None },
            hash: if self.hash { item.declared_hash() } else { None },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Expected<'a> {
    pub size: Option<u64>,
    pub hash: Option<&'a str>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VerificationOutcome {
    pub exists: bool,
    pub size_matches: Option<bool>,
    pub hash_matches: Option<bool>,
}

impl VerificationOutcome {
    pub fn passed(&self, expected: Expected<'_>, strict: bool) -> bool {
        if !self.exists {
            return false;
        }
        if strict && expected.size.is_none() && expected.hash.is_none() {
            return false;
        }
        self.size_matches != Some(false) && self.hash_matches != Some(false)
    }
}

pub async fn inspect_file(dest: &Path, expected: Expected<'_>) -> io::Result<VerificationOutcome> {
    let meta = match tokio::fs::metadata(dest).await {
        Ok(meta) if meta.is_file() => meta,
        Ok(_) => return Ok(VerificationOutcome::default()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => {
            return Ok(VerificationOutcome::default());
        }
        Err(err) => return Err(err),
    };

    let mut outcome = VerificationOutcome {
        exists: true,
        ..VerificationOutcome::default()
    };

    if let Some(size) = expected.size {
        let matches = meta.len() == size;
        outcome.size_matches = Some(matches);
        if !matches {
            info!(
                path = %dest.display(),
                expected = size,
                actual = meta.len(),
                "wrong size"
            );
            return Ok(outcome);
        }
    }

    if let Some(hash) = expected.hash {
        let actual = hash_file(dest).await?;
        let matches = actual == hash;
        outcome.hash_matches = Some(matches);
        if !matches {
            info!(path = %dest.display(), expected = hash, %actual, "wrong hash");
        }
    }

    Ok(outcome)
}

// Strict mode fails a file when nothing was declared.
pub async fn verify_file(dest: &Path, expected: Expected<'_>, strict: bool) -> io::Result<bool> {
    let outcome = inspect_file(dest, expected).await?;
    if !outcome.exists {
        debug!(path = %dest.display(), "does not exist");
    } else if strict && expected.size.is_none() && expected.hash.is_none() {
        info!(path = %dest.display(), "no size or hash to verify against");
    }
    Ok(outcome.passed(expected, strict))
}

#[cfg(test)]
mod tests {
    use super::*;
    use odm_core::QuickXorHash;
    use tempfile::tempdir;

    fn expected(size: Option<u64>, hash: Option<&str>) -> Expected<'_> {
        Expected { size, hash }
    }

    #[test]
    fn parses_diff_scope() {
        assert_eq!(
            "size".parse::<DiffScope>().unwrap(),
            DiffScope {
                size: true,
                hash: false
            }
        );
        assert_eq!("hash, size".parse::<DiffScope>().unwrap(), DiffScope::default());
        assert!("mtime".parse::<DiffScope>().is_err());
    }

    #[tokio::test]
    async fn matching_file_passes() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        std::fs::write(&dest, b"0123456789").unwrap();
        let hash = QuickXorHash::digest(b"0123456789");

        assert!(verify_file(&dest, expected(Some(10), Some(&hash)), true).await.unwrap());
        assert!(verify_file(&dest, expected(Some(10), None), true).await.unwrap());
    }

    #[tokio::test]
    async fn truncated_file_fails_on_size_without_hashing() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        std::fs::write(&dest, b"012345678").unwrap();
        let hash = QuickXorHash::digest(b"0123456789");

        let outcome = inspect_file(&dest, expected(Some(10), Some(&hash))).await.unwrap();
        assert_eq!(outcome.size_matches, Some(false));
        assert_eq!(outcome.hash_matches, None);
        assert!(!verify_file(&dest, expected(Some(10), Some(&hash)), false).await.unwrap());
    }

    #[tokio::test]
    async fn hash_mismatch_fails() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        std::fs::write(&dest, b"0123456780").unwrap();
        let hash = QuickXorHash::digest(b"0123456789");

        assert!(!verify_file(&dest, expected(Some(10), Some(&hash)), true).await.unwrap());
    }

    #[tokio::test]
    async fn strictness_decides_when_nothing_is_declared() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("a.txt");
        std::fs::write(&dest, b"data").unwrap();

        assert!(verify_file(&dest, Expected::default(), false).await.unwrap());
        assert!(!verify_file(&dest, Expected::default(), true).await.unwrap());
    }

    #[tokio::test]
    async fn missing_file_never_passes() {
        let dir = tempdir().unwrap();
        let dest = dir.path().join("missing.txt");
        assert!(!verify_file(&dest, Expected::default(), false).await.unwrap());
        assert!(!verify_file(dir.path(), Expected::default(), false).await.unwrap());
    }
}
