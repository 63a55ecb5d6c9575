//! Partial model decryption.
//!
//! Encrypted models keep most of the file in the clear and encrypt one run of
//! 16-byte blocks. The session asks a [`ModelDecryptor`] for the whole file
//! with that run decrypted and hands the bytes straight to the engine.

use std::fmt;
use std::path::Path;

use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes128;
use tracing::debug;

use crate::config::ENCRYPTION_BLOCK;
use crate::error::{InferError, Result};

pub trait ModelDecryptor: Send + Sync {
    /// Read `path` and decrypt blocks `[start_block, start_block + block_count)`
    /// in place; all other bytes are returned unchanged.
    fn decrypt_blocks(&self, path: &Path, start_block: u64, block_count: u64) -> Result<Vec<u8>>;
}

/// AES-128 applied independently to each block of the range.
#[derive(Clone)]
pub struct AesBlockDecryptor {
    cipher: Aes128,
}

impl AesBlockDecryptor {
    pub fn new(key: [u8; 16]) -> Self {
        Self {
            cipher: Aes128::new(&GenericArray::from(key)),
        }
    }

    /// Build from a 32-character hex key.
    pub fn from_hex(key: &str) -> Result<Self> {
        let raw = hex::decode(key.trim()).map_err(|e| InferError::config(format!("bad key: {e}")))?;
        let key: [u8; 16] = raw
            .try_into()
            .map_err(|raw: Vec<u8>| {
                InferError::config(format!("key must be 16 bytes, got {}", raw.len()))
            })?;
        Ok(Self::new(key))
    }

    pub fn encrypt_in_place(&self, data: &mut [u8], start_block: u64, block_count: u64) -> Result<()> {
        for block in block_range(data, start_block, block_count)?.chunks_exact_mut(16) {
            self.cipher
                .encrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }

    pub fn decrypt_in_place(&self, data: &mut [u8], start_block: u64, block_count: u64) -> Result<()> {
        for block in block_range(data, start_block, block_count)?.chunks_exact_mut(16) {
            self.cipher
                .decrypt_block(GenericArray::from_mut_slice(block));
        }
        Ok(())
    }
}

impl fmt::Debug for AesBlockDecryptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AesBlockDecryptor").finish_non_exhaustive()
    }
}

impl ModelDecryptor for AesBlockDecryptor {
    fn decrypt_blocks(&self, path: &Path, start_block: u64, block_count: u64) -> Result<Vec<u8>> {
        if !path.exists() {
            return Err(InferError::FileNotFound(path.to_path_buf()));
        }
        let mut data = std::fs::read(path)?;
        self.decrypt_in_place(&mut data, start_block, block_count)?;
        debug!(
            path = %path.display(),
            start_block,
            block_count,
            bytes = data.len(),
            "decrypted model blocks"
        );
        Ok(data)
    }
}

fn block_range(data: &mut [u8], start_block: u64, block_count: u64) -> Result<&mut [u8]> {
    let total = data.len();
    let out_of_range = || {
        InferError::failed(format!(
            "block range {start_block}+{block_count} lies outside a {total} byte model"
        ))
    };
    let start = start_block
        .checked_mul(ENCRYPTION_BLOCK)
        .and_then(|s| usize::try_from(s).ok())
        .ok_or_else(out_of_range)?;
    let len = block_count
        .checked_mul(ENCRYPTION_BLOCK)
        .and_then(|l| usize::try_from(l).ok())
        .ok_or_else(out_of_range)?;
    let end = start.checked_add(len).ok_or_else(out_of_range)?;
    if end > total {
        return Err(out_of_range());
    }
    Ok(&mut data[start..end])
}
