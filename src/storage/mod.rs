//! # Encrypted Storage Layer
//!
//! Page-level authenticated encryption under a memory-mapped view. Two
//! pieces:
//!
//! - [`cryptor`]: AES-256-CBC + HMAC-SHA-224 over 4096-byte blocks with a
//!   crash-consistent IV table ([`PageCryptor`]).
//! - [`mapping`]: the decrypted page window over an encrypted file, with
//!   lazy decrypt on read, dirty tracking on write, and coherence across
//!   multiple mappings of one physical file ([`EncryptedFileMapping`]).
//!
//! ## On-disk layout
//!
//! The file interleaves one metadata block ahead of every 64 data blocks:
//!
//! ```text
//! Offset 0:      metadata block   64 x 64-byte IvTable records
//! Offset 4096:   data block 0     ciphertext
//! ...
//! Offset 262144: metadata block   records for data blocks 64..128
//! Offset 266240: data block 64
//! ...
//! ```
//!
//! Callers address *data* offsets; [`real_offset`] and [`iv_table_pos`]
//! translate to physical file positions, [`fake_offset`] goes back. The
//! data space the rest of the engine sees is therefore contiguous, and the
//! size helpers below convert between the two spaces.
//!
//! ## Error surface
//!
//! All operations return `eyre::Result`; the caller-distinguishable kinds
//! ([`crate::error::StorageError`]) ride inside and can be downcast. A read
//! of a never-written block is not an error; it reports "no data" and the
//! mapping presents zero-fill.

mod cryptor;
mod mapping;

pub use cryptor::{IvTable, PageCryptor, HMAC_SIZE, USER_KEY_SIZE};
pub use mapping::{EncryptedFileMapping, PAGE_SIZE};

use std::fs::File;
use std::io;

/// Data block size; also the mapping page size.
pub const BLOCK_SIZE: usize = 4096;

/// 64-byte IV records per 4096-byte metadata block.
pub const BLOCKS_PER_METADATA_BLOCK: usize = BLOCK_SIZE / 64;

/// Maps a data offset to its physical position in the file.
pub fn real_offset(pos: u64) -> u64 {
    let index = pos / BLOCK_SIZE as u64;
    let metadata_blocks = index / BLOCKS_PER_METADATA_BLOCK as u64 + 1;
    pos + metadata_blocks * BLOCK_SIZE as u64
}

/// Maps a physical file position back to its data offset.
pub fn fake_offset(pos: u64) -> u64 {
    let m = BLOCKS_PER_METADATA_BLOCK as u64;
    let index = pos / BLOCK_SIZE as u64;
    let metadata_blocks = (index + m) / (m + 1);
    pos - metadata_blocks * BLOCK_SIZE as u64
}

/// Physical position of the IV record for the block at data offset `pos`.
pub fn iv_table_pos(pos: u64) -> u64 {
    let m = BLOCKS_PER_METADATA_BLOCK as u64;
    let index = pos / BLOCK_SIZE as u64;
    let metadata_block = index / m;
    let metadata_index = index % m;
    metadata_block * (m + 1) * BLOCK_SIZE as u64 + metadata_index * 64
}

/// Logical data bytes reachable in a physical file of `size` bytes.
pub fn encrypted_size_to_data_size(size: u64) -> u64 {
    if size == 0 {
        0
    } else {
        fake_offset(size)
    }
}

/// Physical file bytes needed for `size` logical data bytes.
pub fn data_size_to_encrypted_size(size: u64) -> u64 {
    let page = BLOCK_SIZE as u64;
    real_offset((size + page - 1) & !(page - 1))
}

/// Positioned read into `buf`; returns the bytes read, short at EOF.
pub(crate) fn read_at(file: &File, pos: u64, buf: &mut [u8]) -> io::Result<usize> {
    use std::io::{Read, Seek, SeekFrom};
    let mut f = file;
    f.seek(SeekFrom::Start(pos))?;
    let mut read = 0;
    while read < buf.len() {
        match f.read(&mut buf[read..]) {
            Ok(0) => break,
            Ok(n) => read += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(read)
}

/// Positioned write of the whole buffer, extending the file as needed.
pub(crate) fn write_at(file: &File, pos: u64, buf: &[u8]) -> io::Result<()> {
    use std::io::{Seek, SeekFrom, Write};
    let mut f = file;
    f.seek(SeekFrom::Start(pos))?;
    f.write_all(buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    const BS: u64 = BLOCK_SIZE as u64;

    #[test]
    fn real_offset_skips_metadata_blocks() {
        // First 64 data blocks sit behind one metadata block.
        assert_eq!(real_offset(0), BS);
        assert_eq!(real_offset(BS), 2 * BS);
        assert_eq!(real_offset(63 * BS), 64 * BS);
        // Block 64 sits behind a second metadata block.
        assert_eq!(real_offset(64 * BS), 66 * BS);
        assert_eq!(real_offset(128 * BS), 131 * BS);
    }

    #[test]
    fn fake_offset_inverts_real_offset() {
        for block in [0u64, 1, 63, 64, 65, 127, 128, 1000] {
            let pos = block * BS;
            assert_eq!(fake_offset(real_offset(pos)), pos, "block {block}");
            // Interior offsets translate consistently too.
            let pos = pos + 123;
            assert_eq!(fake_offset(real_offset(pos)), pos, "block {block}+123");
        }
    }

    #[test]
    fn iv_table_positions() {
        // Records for the first 64 blocks pack into the metadata block at 0.
        assert_eq!(iv_table_pos(0), 0);
        assert_eq!(iv_table_pos(BS), 64);
        assert_eq!(iv_table_pos(63 * BS), 63 * 64);
        // Block 64's record begins the second metadata block.
        assert_eq!(iv_table_pos(64 * BS), 65 * BS);
        assert_eq!(iv_table_pos(65 * BS), 65 * BS + 64);
    }

    #[test]
    fn size_translations() {
        assert_eq!(encrypted_size_to_data_size(0), 0);
        assert_eq!(data_size_to_encrypted_size(0), BS);
        assert_eq!(data_size_to_encrypted_size(1), 2 * BS);
        assert_eq!(data_size_to_encrypted_size(BS), 2 * BS);
        assert_eq!(data_size_to_encrypted_size(64 * BS), 66 * BS);

        for data in [BS, 2 * BS, 64 * BS, 65 * BS] {
            assert_eq!(
                encrypted_size_to_data_size(data_size_to_encrypted_size(data)),
                data
            );
        }
    }
}
