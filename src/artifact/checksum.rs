//! Artifact checksums
//!
//! SHA-256 over the stored artifact bytes, hex encoded. For an encrypted
//! disk that is the ciphertext, so a stored artifact can be verified without
//! the passphrase. The digest is built while an artifact is uploaded
//! ([`Checksum`]) and again when it is read back.

use sha2::{Digest, Sha256};

use crate::error::{VaultError, VaultResult};
use crate::models::BackupId;

/// Hex-encoded SHA-256 of `bytes`
pub fn compute(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

/// Incremental SHA-256 over a stream of chunks
#[derive(Default)]
pub struct Checksum {
    hasher: Sha256,
}

impl Checksum {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update(&mut self, chunk: &[u8]) {
        self.hasher.update(chunk);
    }

    pub fn finalize(self) -> String {
        hex::encode(self.hasher.finalize())
    }
}

/// Compare the checksum recorded for `backup_id` with one just computed
pub fn matches(backup_id: BackupId, expected: &str, actual: &str) -> VaultResult<()> {
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(VaultError::ChecksumMismatch {
            backup_id: backup_id.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        })
    }
}

/// Check `bytes` against the checksum recorded for `backup_id`
pub fn verify(backup_id: BackupId, expected: &str, bytes: &[u8]) -> VaultResult<()> {
    matches(backup_id, expected, &compute(bytes))
}
