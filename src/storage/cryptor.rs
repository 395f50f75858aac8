//! # Page Cryptor
//!
//! AES-256-CBC + HMAC-SHA-224 over 4096-byte data blocks, with a
//! crash-consistent IV table. This is the unit under the encrypted file
//! mapping: it owns the cipher schedules, the in-memory copy of the IV
//! metadata, and the read/write protocol for individual blocks.
//!
//! ## Why two generations of (IV, HMAC)
//!
//! The IV record and the ciphertext live in different disk blocks, so a
//! crash can persist one without the other. Each block's 64-byte
//! [`IvTable`] therefore keeps the current pair `(iv1, hmac1)` and the
//! previous pair `(iv2, hmac2)`. A write rotates the current pair into the
//! previous slots, bumps `iv1`, writes the IV record, then the ciphertext.
//! A read checks `hmac1` first and falls back to `hmac2`: whichever pair
//! authenticates identifies which generation of ciphertext actually made it
//! to disk.
//!
//! The low 32 bits of the two HMACs are forced distinct at write time, so
//! the fallback can never confuse the generations.
//!
//! ## Block states on disk
//!
//! | iv1 | HMAC check        | Meaning                                |
//! |-----|-------------------|----------------------------------------|
//! | 0   | (skipped)         | never written, no data                 |
//! | ≠0  | hmac1 matches     | current generation                     |
//! | ≠0  | hmac2 matches     | torn write, previous generation        |
//! | ≠0  | neither, all-zero | file truncated and re-extended         |
//! | ≠0  | neither, nonzero  | corruption or wrong key: fatal         |
//!
//! ## Key layout
//!
//! The 64-byte user key splits into the AES-256 key (bytes 0..32) and the
//! HMAC key (bytes 32..64). Encrypt and decrypt schedules are precomputed;
//! the HMAC key is wiped on drop.

use std::fs::File;

use aes::cipher::{
    block_padding::NoPadding, generic_array::GenericArray, BlockDecryptMut, BlockEncryptMut,
    InnerIvInit, KeyInit,
};
use aes::{Aes256Dec, Aes256Enc};
use eyre::{ensure, Result};
use hmac::{Hmac, Mac};
use sha2::Sha224;
use subtle::ConstantTimeEq;
use tracing::{debug, warn};
use zerocopy::little_endian::U32;
use zerocopy::{FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout};
use zeroize::{Zeroize, ZeroizeOnDrop};

use super::{iv_table_pos, read_at, real_offset, write_at, BLOCK_SIZE, BLOCKS_PER_METADATA_BLOCK};
use crate::error::StorageError;

type HmacSha224 = Hmac<Sha224>;

pub const HMAC_SIZE: usize = 28;
pub const USER_KEY_SIZE: usize = 64;

/// One block's IV metadata: current and previous (IV, HMAC) generation.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct IvTable {
    iv1: U32,
    hmac1: [u8; HMAC_SIZE],
    iv2: U32,
    hmac2: [u8; HMAC_SIZE],
}

impl IvTable {
    pub fn iv1(&self) -> u32 {
        self.iv1.get()
    }

    pub fn iv2(&self) -> u32 {
        self.iv2.get()
    }

    pub fn hmac1(&self) -> &[u8; HMAC_SIZE] {
        &self.hmac1
    }

    pub fn hmac2(&self) -> &[u8; HMAC_SIZE] {
        &self.hmac2
    }

    /// Rotates the current generation into the previous slots.
    fn rotate(&mut self) {
        self.iv2 = self.iv1;
        self.hmac2 = self.hmac1;
    }

    /// Un-bumps after a torn write: the previous generation becomes current
    /// again.
    fn roll_back(&mut self) {
        self.iv1 = self.iv2;
        self.hmac1 = self.hmac2;
    }

    /// Bumps iv1, skipping 0 which is reserved for "never written".
    fn bump(&mut self) {
        let mut iv = self.iv1.get().wrapping_add(1);
        if iv == 0 {
            iv = 1;
        }
        self.iv1 = U32::new(iv);
    }
}

#[derive(Zeroize, ZeroizeOnDrop)]
struct HmacKey([u8; 32]);

/// Block cipher state for one encrypted file.
pub struct PageCryptor {
    enc: Aes256Enc,
    dec: Aes256Dec,
    hmac_key: HmacKey,
    /// In-memory copy of the IV tables, grown in whole metadata blocks.
    iv_buffer: Vec<IvTable>,
    rw_buffer: Box<[u8; BLOCK_SIZE]>,
}

impl PageCryptor {
    pub fn new(key: &[u8; USER_KEY_SIZE]) -> Self {
        let mut aes_key = [0u8; 32];
        aes_key.copy_from_slice(&key[..32]);
        let mut hmac_key = [0u8; 32];
        hmac_key.copy_from_slice(&key[32..]);
        let cryptor = PageCryptor {
            enc: Aes256Enc::new(GenericArray::from_slice(&aes_key)),
            dec: Aes256Dec::new(GenericArray::from_slice(&aes_key)),
            hmac_key: HmacKey(hmac_key),
            iv_buffer: Vec::new(),
            rw_buffer: Box::new([0u8; BLOCK_SIZE]),
        };
        aes_key.zeroize();
        cryptor
    }

    /// Pre-sizes the IV buffer for a file of `data_size` logical bytes.
    pub fn set_file_size(&mut self, data_size: u64) {
        let blocks = (data_size as usize + BLOCK_SIZE - 1) / BLOCK_SIZE;
        let rounded = blocks.next_multiple_of(BLOCKS_PER_METADATA_BLOCK);
        if rounded > self.iv_buffer.capacity() {
            self.iv_buffer.reserve(rounded - self.iv_buffer.len());
        }
    }

    /// Decrypts `dst.len()` bytes of data starting at data offset `pos`.
    /// Returns false when any covered block has never been written (the
    /// caller treats the range as unallocated).
    pub fn read(&mut self, file: &File, mut pos: u64, dst: &mut [u8]) -> Result<bool> {
        ensure!(
            dst.len() % BLOCK_SIZE == 0,
            "read size {} is not block-aligned",
            dst.len()
        );
        for chunk in dst.chunks_mut(BLOCK_SIZE) {
            if !self.read_block(file, pos, chunk)? {
                return Ok(false);
            }
            pos += BLOCK_SIZE as u64;
        }
        Ok(true)
    }

    fn read_block(&mut self, file: &File, pos: u64, dst: &mut [u8]) -> Result<bool> {
        self.rw_buffer.fill(0);
        let bytes_read = read_at(file, real_offset(pos), &mut self.rw_buffer[..])
            .map_err(StorageError::Io)?;
        if bytes_read == 0 {
            return Ok(false);
        }

        let idx = self.load_iv_block(file, pos)?;
        if self.iv_buffer[idx].iv1() == 0 {
            // Never written; the caller is reading pre-allocated space.
            return Ok(false);
        }

        if !self.check_hmac(bytes_read, self.iv_buffer[idx].hmac1) {
            // Either corruption, or a crash between the IV record update
            // and the ciphertext write.
            if self.iv_buffer[idx].iv2() == 0 {
                // The very first write was interrupted.
                return Ok(false);
            }
            if self.check_hmac(bytes_read, self.iv_buffer[idx].hmac2) {
                debug!(pos, "torn write detected, rolling back to previous iv");
                self.iv_buffer[idx].roll_back();
            } else if self.rw_buffer[..bytes_read].iter().all(|&b| b == 0) {
                // Truncated and re-extended: stale HMACs over zero fill.
                return Ok(false);
            } else {
                warn!(pos, "block failed authentication against both generations");
                return Err(StorageError::DecryptionFailed.into());
            }
        }

        let iv = build_iv(pos, self.iv_buffer[idx].iv1());
        cbc::Decryptor::<Aes256Dec>::inner_iv_init(self.dec.clone(), GenericArray::from_slice(&iv))
            .decrypt_padded_b2b_mut::<NoPadding>(&self.rw_buffer[..], dst)
            .map_err(|_| eyre::eyre!("block-aligned decrypt cannot fail padding"))?;
        Ok(true)
    }

    /// Encrypts and writes `src` at data offset `pos`, updating the IV
    /// record first so a crash at any point leaves a readable generation.
    pub fn write(&mut self, file: &File, mut pos: u64, src: &[u8]) -> Result<()> {
        ensure!(
            src.len() % BLOCK_SIZE == 0,
            "write size {} is not block-aligned",
            src.len()
        );
        for chunk in src.chunks(BLOCK_SIZE) {
            self.write_block(file, pos, chunk)?;
            pos += BLOCK_SIZE as u64;
        }
        Ok(())
    }

    fn write_block(&mut self, file: &File, pos: u64, src: &[u8]) -> Result<()> {
        let idx = self.load_iv_block(file, pos)?;
        self.iv_buffer[idx].rotate();
        loop {
            self.iv_buffer[idx].bump();
            let iv = build_iv(pos, self.iv_buffer[idx].iv1());
            cbc::Encryptor::<Aes256Enc>::inner_iv_init(
                self.enc.clone(),
                GenericArray::from_slice(&iv),
            )
            .encrypt_padded_b2b_mut::<NoPadding>(src, &mut self.rw_buffer[..])
            .map_err(|_| eyre::eyre!("block-aligned encrypt cannot fail padding"))?;
            let hmac = self.compute_hmac(&self.rw_buffer[..]);
            self.iv_buffer[idx].hmac1 = hmac;

            // If the old and new generations share their low 32 HMAC bits
            // a torn-write read could not tell them apart; bump until they
            // differ.
            if self.iv_buffer[idx].hmac1[..4] != self.iv_buffer[idx].hmac2[..4] {
                break;
            }
        }

        let table = self.iv_buffer[idx];
        write_at(file, iv_table_pos(pos), table.as_bytes()).map_err(StorageError::Io)?;
        write_at(file, real_offset(pos), &self.rw_buffer[..]).map_err(StorageError::Io)?;
        Ok(())
    }

    /// Ensures the IV table for `pos` is resident, loading its whole
    /// metadata block from disk on first touch. Returns the block index.
    fn load_iv_block(&mut self, file: &File, pos: u64) -> Result<usize> {
        let idx = (pos as usize) / BLOCK_SIZE;
        if idx < self.iv_buffer.len() {
            return Ok(idx);
        }

        let old_len = self.iv_buffer.len();
        let new_len = (idx + 1).next_multiple_of(BLOCKS_PER_METADATA_BLOCK);
        self.iv_buffer.resize(new_len, IvTable::new_zeroed());

        let mut raw = [0u8; BLOCK_SIZE];
        for chunk_start in (old_len..new_len).step_by(BLOCKS_PER_METADATA_BLOCK) {
            raw.fill(0);
            let n = read_at(
                file,
                iv_table_pos((chunk_start * BLOCK_SIZE) as u64),
                &mut raw,
            )
            .map_err(StorageError::Io)?;
            if n == 0 {
                continue; // fresh metadata block, stays zeroed
            }
            for (i, bytes) in raw.chunks(size_of::<IvTable>()).enumerate() {
                self.iv_buffer[chunk_start + i] = IvTable::read_from_bytes(bytes)
                    .map_err(|e| eyre::eyre!("failed to read IvTable: {e:?}"))?;
            }
        }
        Ok(idx)
    }

    fn compute_hmac(&self, data: &[u8]) -> [u8; HMAC_SIZE] {
        let mut mac = <HmacSha224 as Mac>::new_from_slice(&self.hmac_key.0)
            .expect("hmac accepts any key length");
        mac.update(data);
        let tag = mac.finalize().into_bytes();
        let mut out = [0u8; HMAC_SIZE];
        out.copy_from_slice(&tag);
        out
    }

    /// Constant-time comparison of the stored HMAC against the ciphertext
    /// currently in the rw buffer.
    fn check_hmac(&self, len: usize, stored: [u8; HMAC_SIZE]) -> bool {
        let computed = self.compute_hmac(&self.rw_buffer[..len]);
        bool::from(computed.ct_eq(&stored))
    }
}

impl std::fmt::Debug for PageCryptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PageCryptor")
            .field("iv_blocks", &self.iv_buffer.len())
            .finish()
    }
}

/// 16-byte CBC IV for a block: `[iv1 LE || data pos LE || zero]`. The data
/// position folds the block's location into the stream, so equal plaintext
/// at different offsets never shares ciphertext.
fn build_iv(pos: u64, iv1: u32) -> [u8; 16] {
    let mut iv = [0u8; 16];
    iv[..4].copy_from_slice(&iv1.to_le_bytes());
    iv[4..12].copy_from_slice(&pos.to_le_bytes());
    iv
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn test_key() -> [u8; USER_KEY_SIZE] {
        let mut key = [0u8; USER_KEY_SIZE];
        for (i, b) in key.iter_mut().enumerate() {
            *b = (i as u8).wrapping_mul(37).wrapping_add(11);
        }
        key
    }

    fn scratch_file() -> File {
        tempfile::tempfile().unwrap()
    }

    #[test]
    fn iv_table_is_64_bytes() {
        assert_eq!(size_of::<IvTable>(), 64);
        assert_eq!(BLOCK_SIZE % size_of::<IvTable>(), 0);
    }

    #[test]
    fn round_trip_one_block() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        let plain = [0x5au8; BLOCK_SIZE];

        cryptor.write(&file, 0, &plain).unwrap();
        let mut out = [0u8; BLOCK_SIZE];
        assert!(cryptor.read(&file, 0, &mut out).unwrap());
        assert_eq!(out, plain);

        // The ciphertext on disk is not the plaintext.
        let mut raw = [0u8; BLOCK_SIZE];
        read_at(&file, real_offset(0), &mut raw).unwrap();
        assert_ne!(raw, plain);
    }

    #[test]
    fn fresh_cryptor_reads_existing_file() {
        let file = scratch_file();
        let mut writer = PageCryptor::new(&test_key());
        let plain = [7u8; BLOCK_SIZE];
        writer.write(&file, 4096, &plain).unwrap();

        // A second cryptor over the same file loads the IV table from disk.
        let mut reader = PageCryptor::new(&test_key());
        let mut out = [0u8; BLOCK_SIZE];
        assert!(reader.read(&file, 4096, &mut out).unwrap());
        assert_eq!(out, plain);
    }

    #[test]
    fn never_written_block_reports_no_data() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        let mut out = [0u8; BLOCK_SIZE];
        assert!(!cryptor.read(&file, 0, &mut out).unwrap());

        // Writing block 1 leaves block 0 unwritten but physically present.
        cryptor.write(&file, 4096, &[1u8; BLOCK_SIZE]).unwrap();
        let mut fresh = PageCryptor::new(&test_key());
        assert!(!fresh.read(&file, 0, &mut out).unwrap());
    }

    #[test]
    fn wrong_key_is_decryption_failure() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        cryptor.write(&file, 0, &[3u8; BLOCK_SIZE]).unwrap();

        let mut bad_key = test_key();
        bad_key[40] ^= 0xff; // corrupt the HMAC half
        let mut other = PageCryptor::new(&bad_key);
        let mut out = [0u8; BLOCK_SIZE];
        let err = other.read(&file, 0, &mut out).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<StorageError>(),
            Some(StorageError::DecryptionFailed)
        ));
    }

    #[test]
    fn torn_iv_write_falls_back_to_previous_generation() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        let old = [0xaau8; BLOCK_SIZE];
        let new = [0xbbu8; BLOCK_SIZE];
        cryptor.write(&file, 0, &old).unwrap();

        // Stage a torn write: capture the ciphertext of the first
        // generation, do a second write, then restore the old ciphertext so
        // only the IV record of the new write persisted.
        let mut old_cipher = [0u8; BLOCK_SIZE];
        read_at(&file, real_offset(0), &mut old_cipher).unwrap();
        cryptor.write(&file, 0, &new).unwrap();
        write_at(&file, real_offset(0), &old_cipher).unwrap();

        let mut reader = PageCryptor::new(&test_key());
        let mut out = [0u8; BLOCK_SIZE];
        assert!(reader.read(&file, 0, &mut out).unwrap());
        assert_eq!(out, old, "reader must fall back to the old plaintext");
    }

    #[test]
    fn truncate_and_reextend_reads_as_unallocated() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        cryptor.write(&file, 0, &[9u8; BLOCK_SIZE]).unwrap();

        // Zero the ciphertext while leaving the IV record in place, the
        // shape ftruncate() leaves behind.
        write_at(&file, real_offset(0), &[0u8; BLOCK_SIZE]).unwrap();
        (&file).flush().unwrap();

        let mut reader = PageCryptor::new(&test_key());
        let mut out = [0u8; BLOCK_SIZE];
        assert!(!reader.read(&file, 0, &mut out).unwrap());
    }

    #[test]
    fn distinct_positions_produce_distinct_ciphertext() {
        let file = scratch_file();
        let mut cryptor = PageCryptor::new(&test_key());
        let plain = [0x11u8; BLOCK_SIZE];
        cryptor.write(&file, 0, &plain).unwrap();
        cryptor.write(&file, 4096, &plain).unwrap();

        let mut a = [0u8; BLOCK_SIZE];
        let mut b = [0u8; BLOCK_SIZE];
        read_at(&file, real_offset(0), &mut a).unwrap();
        read_at(&file, real_offset(4096), &mut b).unwrap();
        assert_ne!(a, b);
    }
}
