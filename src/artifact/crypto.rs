//! Artifact encryption
//!
//! AES-256-GCM over fixed-size frames, keyed with Argon2id from the disk's
//! passphrase. An encrypted artifact is a header followed by frames:
//!
//! ```text
//! header: "CVENC1" | m_cost u32 | t_cost u32 | p_cost u32 | salt_len u8 | salt
//! frame:  final u8 | len u32 | nonce [12] | ciphertext+tag [len]
//! ```
//!
//! Integers are big endian. Each frame authenticates its index and its final
//! flag as associated data, so frames cannot be reordered, dropped or cut
//! off after the last one without decryption failing.

use aes_gcm::aead::rand_core::RngCore;
use aes_gcm::{
    aead::{Aead, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use argon2::{
    password_hash::{rand_core::OsRng as SaltRng, PasswordHasher, SaltString},
    Argon2, Params,
};
use zeroize::Zeroizing;

use crate::config::settings::EncryptionSettings;
use crate::error::{VaultError, VaultResult};

const MAGIC: &[u8; 6] = b"CVENC1";

/// Size of the AES-GCM nonce in bytes (96 bits)
const NONCE_SIZE: usize = 12;

const TAG_SIZE: usize = 16;

/// Plaintext bytes per frame
pub const FRAME_SIZE: usize = 64 * 1024;

const FRAME_HEADER: usize = 1 + 4 + NONCE_SIZE;

/// Passphrase and Argon2 cost for one disk
pub struct ArtifactCipher {
    passphrase: Zeroizing<String>,
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
}

impl ArtifactCipher {
    pub fn new(settings: &EncryptionSettings) -> VaultResult<Self> {
        if settings.passphrase.is_empty() {
            return Err(VaultError::Encryption("passphrase must not be empty".into()));
        }
        argon2_params(settings.memory_cost_kib, settings.time_cost, settings.parallelism)?;

        Ok(Self {
            passphrase: Zeroizing::new(settings.passphrase.clone()),
            memory_cost: settings.memory_cost_kib,
            time_cost: settings.time_cost,
            parallelism: settings.parallelism,
        })
    }

    /// Start sealing a new artifact under a fresh salt
    pub fn encryptor(&self) -> VaultResult<FrameEncryptor> {
        let salt = SaltString::generate(&mut SaltRng);
        let cipher = derive_cipher(
            &self.passphrase,
            &salt,
            self.memory_cost,
            self.time_cost,
            self.parallelism,
        )?;

        let salt = salt.as_str().as_bytes();
        let mut header = Vec::with_capacity(MAGIC.len() + 13 + salt.len());
        header.extend_from_slice(MAGIC);
        header.extend_from_slice(&self.memory_cost.to_be_bytes());
        header.extend_from_slice(&self.time_cost.to_be_bytes());
        header.extend_from_slice(&self.parallelism.to_be_bytes());
        header.push(salt.len() as u8);
        header.extend_from_slice(salt);

        Ok(FrameEncryptor {
            cipher,
            header: Some(header),
            buffer: Vec::with_capacity(FRAME_SIZE * 2),
            index: 0,
        })
    }

    /// Start opening an artifact; the key is derived once the header is in
    pub fn decryptor(&self) -> FrameDecryptor {
        FrameDecryptor {
            passphrase: self.passphrase.clone(),
            cipher: None,
            buffer: Vec::new(),
            index: 0,
            finished: false,
        }
    }
}

fn argon2_params(memory_cost: u32, time_cost: u32, parallelism: u32) -> VaultResult<Params> {
    Params::new(memory_cost, time_cost, parallelism, Some(32))
        .map_err(|e| VaultError::Encryption(format!("Invalid Argon2 parameters: {}", e)))
}

fn derive_cipher(
    passphrase: &str,
    salt: &SaltString,
    memory_cost: u32,
    time_cost: u32,
    parallelism: u32,
) -> VaultResult<Aes256Gcm> {
    let params = argon2_params(memory_cost, time_cost, parallelism)?;
    let argon2 = Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);

    let hash = argon2
        .hash_password(passphrase.as_bytes(), salt)
        .map_err(|e| VaultError::Encryption(format!("Key derivation failed: {}", e)))?;
    let output = hash
        .hash
        .ok_or_else(|| VaultError::Encryption("No hash output generated".to_string()))?;

    let bytes = output.as_bytes();
    if bytes.len() < 32 {
        return Err(VaultError::Encryption(
            "Hash output too short for AES-256 key".to_string(),
        ));
    }
    let mut key = Zeroizing::new([0u8; 32]);
    key.copy_from_slice(&bytes[..32]);

    Aes256Gcm::new_from_slice(&key[..])
        .map_err(|e| VaultError::Encryption(format!("Failed to create cipher: {}", e)))
}

fn frame_aad(index: u64, last: bool) -> [u8; 9] {
    let mut aad = [0u8; 9];
    aad[..8].copy_from_slice(&index.to_be_bytes());
    aad[8] = last as u8;
    aad
}

/// Streaming sealer: plaintext in, stored bytes out
pub struct FrameEncryptor {
    cipher: Aes256Gcm,
    header: Option<Vec<u8>>,
    buffer: Vec<u8>,
    index: u64,
}

impl FrameEncryptor {
    /// Feed plaintext; returns whatever is ready to be stored
    pub fn update(&mut self, chunk: &[u8]) -> VaultResult<Vec<u8>> {
        let mut out = self.header.take().unwrap_or_default();
        self.buffer.extend_from_slice(chunk);

        // Strictly more than a frame, so the final frame always has an owner
        while self.buffer.len() > FRAME_SIZE {
            let rest = self.buffer.split_off(FRAME_SIZE);
            let frame = std::mem::replace(&mut self.buffer, rest);
            self.seal(&frame, false, &mut out)?;
        }
        Ok(out)
    }

    /// Seal the remaining plaintext as the final frame
    pub fn finish(mut self) -> VaultResult<Vec<u8>> {
        let mut out = self.header.take().unwrap_or_default();
        let last = std::mem::take(&mut self.buffer);
        self.seal(&last, true, &mut out)?;
        Ok(out)
    }

    fn seal(&mut self, plaintext: &[u8], last: bool, out: &mut Vec<u8>) -> VaultResult<()> {
        let mut nonce_bytes = [0u8; NONCE_SIZE];
        OsRng.fill_bytes(&mut nonce_bytes);

        let aad = frame_aad(self.index, last);
        let sealed = self
            .cipher
            .encrypt(
                Nonce::from_slice(&nonce_bytes),
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|e| VaultError::Encryption(format!("Encryption failed: {}", e)))?;

        out.push(last as u8);
        out.extend_from_slice(&(sealed.len() as u32).to_be_bytes());
        out.extend_from_slice(&nonce_bytes);
        out.extend_from_slice(&sealed);
        self.index += 1;
        Ok(())
    }
}

/// Streaming opener: stored bytes in, plaintext out
pub struct FrameDecryptor {
    passphrase: Zeroizing<String>,
    cipher: Option<Aes256Gcm>,
    buffer: Vec<u8>,
    index: u64,
    finished: bool,
}

impl FrameDecryptor {
    /// Feed stored bytes; returns the plaintext of every complete frame
    pub fn update(&mut self, chunk: &[u8]) -> VaultResult<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        let mut out = Vec::new();

        if self.cipher.is_none() && !self.read_header()? {
            return Ok(out);
        }

        while let Some(plaintext) = self.open_frame()? {
            out.extend_from_slice(&plaintext);
        }
        Ok(out)
    }

    /// Fail unless the final frame was seen and nothing follows it
    pub fn finish(self) -> VaultResult<()> {
        if !self.finished {
            return Err(VaultError::Encryption(
                "encrypted artifact is truncated".to_string(),
            ));
        }
        if !self.buffer.is_empty() {
            return Err(VaultError::Encryption(
                "unexpected data after the final frame".to_string(),
            ));
        }
        Ok(())
    }

    fn read_header(&mut self) -> VaultResult<bool> {
        let fixed = MAGIC.len() + 13;
        if self.buffer.len() < fixed {
            return Ok(false);
        }
        if &self.buffer[..MAGIC.len()] != MAGIC {
            return Err(VaultError::Encryption(
                "artifact is not encrypted by chainvault".to_string(),
            ));
        }
        let salt_len = self.buffer[fixed - 1] as usize;
        if self.buffer.len() < fixed + salt_len {
            return Ok(false);
        }

        let word = |at: usize| {
            let mut bytes = [0u8; 4];
            bytes.copy_from_slice(&self.buffer[at..at + 4]);
            u32::from_be_bytes(bytes)
        };
        let (memory_cost, time_cost, parallelism) = (word(6), word(10), word(14));

        let salt = std::str::from_utf8(&self.buffer[fixed..fixed + salt_len])
            .map_err(|_| VaultError::Encryption("Invalid salt encoding".to_string()))?;
        let salt = SaltString::from_b64(salt)
            .map_err(|e| VaultError::Encryption(format!("Invalid salt: {}", e)))?;

        self.cipher = Some(derive_cipher(
            &self.passphrase,
            &salt,
            memory_cost,
            time_cost,
            parallelism,
        )?);
        self.buffer.drain(..fixed + salt_len);
        Ok(true)
    }

    fn open_frame(&mut self) -> VaultResult<Option<Vec<u8>>> {
        if self.buffer.is_empty() {
            return Ok(None);
        }
        if self.finished {
            return Err(VaultError::Encryption(
                "unexpected data after the final frame".to_string(),
            ));
        }
        if self.buffer.len() < FRAME_HEADER {
            return Ok(None);
        }

        let last = match self.buffer[0] {
            0 => false,
            1 => true,
            other => {
                return Err(VaultError::Encryption(format!("invalid frame flag {}", other)))
            }
        };
        let mut len_bytes = [0u8; 4];
        len_bytes.copy_from_slice(&self.buffer[1..5]);
        let len = u32::from_be_bytes(len_bytes) as usize;
        if len < TAG_SIZE || len > FRAME_SIZE + TAG_SIZE {
            return Err(VaultError::Encryption(format!("invalid frame length {}", len)));
        }
        if self.buffer.len() < FRAME_HEADER + len {
            return Ok(None);
        }

        let cipher = self
            .cipher
            .as_ref()
            .ok_or_else(|| VaultError::Encryption("artifact header missing".to_string()))?;
        let aad = frame_aad(self.index, last);
        let plaintext = cipher
            .decrypt(
                Nonce::from_slice(&self.buffer[5..FRAME_HEADER]),
                Payload {
                    msg: &self.buffer[FRAME_HEADER..FRAME_HEADER + len],
                    aad: &aad,
                },
            )
            .map_err(|_| {
                VaultError::Encryption(
                    "Decryption failed: invalid key or corrupted data".to_string(),
                )
            })?;

        self.buffer.drain(..FRAME_HEADER + len);
        self.index += 1;
        self.finished = last;
        Ok(Some(plaintext))
    }
}

#[cfg(test)]
pub(crate) fn fast_settings(passphrase: &str) -> EncryptionSettings {
    EncryptionSettings {
        passphrase: passphrase.to_string(),
        memory_cost_kib: 256,
        time_cost: 1,
        parallelism: 1,
    }
}
