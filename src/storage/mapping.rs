//! # Encrypted File Mapping
//!
//! A page-granular decrypted view over an encrypted file. The mapping owns
//! an anonymous memory map the size of its window; pages are decrypted into
//! it lazily on the read barrier and encrypted back on flush. Several
//! mappings may cover one physical file, possibly opened through
//! different handles, and stay coherent through a shared per-file record.
//!
//! ## Registry
//!
//! A process-wide registry keys every open encrypted file by identity
//! (`(device, inode)` on POSIX, canonical path elsewhere) and holds one
//! [`SharedFileInfo`] per file: the file handle, the [`PageCryptor`], and
//! the list of live mappings. Mappings self-register on construction and
//! self-unregister on drop; the last mapping of a file drops its entry,
//! closing the handle. The registry itself is a `Lazy` static and is never
//! torn down.
//!
//! ## Coherence protocol
//!
//! Per mapping, two bit-vectors track page state: `up_to_date` (the
//! decrypted bytes reflect the last observed ciphertext) and `dirty`
//! (local writes not yet flushed).
//!
//! - **Read barrier**: a page not up to date is copied from a sibling
//!   mapping that has it up to date, else decrypted from disk; then marked
//!   up to date.
//! - **Write barrier**: every covered page must already be up to date. Each
//!   sibling holding the page flushes its own dirty state first, then marks
//!   the page outdated; the page is marked dirty here.
//! - **Flush** encrypts dirty pages back through the cryptor; **sync**
//!   fsyncs the file.
//!
//! All barriers for one file serialize on a single mutex, which is also
//! what makes the sibling accesses sound: mapping state is only ever
//! touched by the thread currently holding the file's lock.

use std::fs::{File, OpenOptions};
use std::path::Path;
use std::ptr::NonNull;
use std::sync::Arc;

use eyre::{ensure, Result, WrapErr};
use memmap2::MmapMut;
use once_cell::sync::Lazy;
use parking_lot::Mutex;
use tracing::debug;

use super::{PageCryptor, BLOCK_SIZE, USER_KEY_SIZE};
use crate::error::StorageError;

/// Mapping pages are one crypto block; the cryptor and the coherence
/// machinery share their page geometry.
pub const PAGE_SIZE: usize = BLOCK_SIZE;

/// Identity of a physical file, independent of the path used to open it.
#[derive(Debug, Clone, PartialEq, Eq)]
enum FileId {
    #[cfg(unix)]
    DevIno(u64, u64),
    #[cfg_attr(unix, allow(dead_code))]
    Path(std::path::PathBuf),
}

fn file_id(path: &Path, file: &File) -> Result<FileId> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        let meta = file.metadata().map_err(StorageError::Io)?;
        let _ = path;
        Ok(FileId::DevIno(meta.dev(), meta.ino()))
    }
    #[cfg(not(unix))]
    {
        let _ = file;
        let canonical = path.canonicalize().map_err(StorageError::Io)?;
        Ok(FileId::Path(canonical))
    }
}

/// Per-file shared state: the handle, the cryptor, and the live mappings.
pub struct SharedFileInfo {
    file: File,
    cryptor: PageCryptor,
    /// Raw pointers to the boxed state of every live mapping over this
    /// file. Only dereferenced while the owning `SharedFile` lock is held.
    mappings: Vec<NonNull<MappingInner>>,
}

struct SharedFile {
    state: Mutex<SharedFileInfo>,
}

// SAFETY: SharedFileInfo is only reachable through the Mutex above; the raw
// mapping pointers it stores are dereferenced exclusively under that lock.
unsafe impl Send for SharedFileInfo {}
unsafe impl Sync for SharedFile {}

/// Process-wide table of open encrypted files. Deliberately leaked: tearing
/// it down at exit races against threads still flushing.
static REGISTRY: Lazy<Mutex<Vec<(FileId, Arc<SharedFile>)>>> = Lazy::new(|| Mutex::new(Vec::new()));

struct MappingInner {
    shared: Arc<SharedFile>,
    buf: MmapMut,
    /// Data-space offset of this window; page-aligned.
    file_offset: u64,
    page_count: usize,
    up_to_date: Vec<bool>,
    dirty: Vec<bool>,
}

impl MappingInner {
    fn first_page(&self) -> usize {
        self.file_offset as usize / PAGE_SIZE
    }

    fn page_slice(&self, page: usize) -> &[u8] {
        &self.buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE]
    }

    fn page_slice_mut(&mut self, page: usize) -> &mut [u8] {
        &mut self.buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE]
    }

    /// Local page index covering an absolute data page, if inside the
    /// window.
    fn local_page(&self, abs_page: usize) -> Option<usize> {
        abs_page
            .checked_sub(self.first_page())
            .filter(|&p| p < self.page_count)
    }

    /// Encrypt-writes every dirty page. Pages stay up to date: the buffer
    /// contents are what was just persisted.
    fn flush(&mut self, state: &mut SharedFileInfo) -> Result<()> {
        let SharedFileInfo { file, cryptor, .. } = state;
        let mut flushed = 0usize;
        for page in 0..self.page_count {
            if !self.dirty[page] {
                continue;
            }
            let pos = self.file_offset + (page * PAGE_SIZE) as u64;
            let data = &self.buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE];
            cryptor.write(file, pos, data)?;
            self.dirty[page] = false;
            flushed += 1;
        }
        if flushed > 0 {
            debug!(pages = flushed, "flushed dirty pages");
        }
        Ok(())
    }

    /// Sibling notification that `abs_page` changed elsewhere. Own dirty
    /// writes are flushed first so they are not lost to the refresh.
    fn mark_outdated(&mut self, abs_page: usize, state: &mut SharedFileInfo) -> Result<()> {
        let Some(page) = self.local_page(abs_page) else {
            return Ok(());
        };
        if self.dirty[page] {
            self.flush(state)?;
        }
        self.up_to_date[page] = false;
        Ok(())
    }
}

/// Decrypted window over an encrypted file.
///
/// Not `Sync`: one mapping belongs to one owner. `Send` is fine because
/// all cross-mapping state is guarded by the per-file lock.
pub struct EncryptedFileMapping {
    inner: NonNull<MappingInner>,
}

// SAFETY: the inner state is boxed (stable address) and only shared with
// sibling mappings through the per-file mutex; moving the handle between
// threads moves exclusive ownership.
unsafe impl Send for EncryptedFileMapping {}

impl EncryptedFileMapping {
    /// Opens (creating if needed) `path` and maps `size` bytes of its data
    /// space starting at `file_offset`. Both must be page-aligned.
    pub fn map(
        path: impl AsRef<Path>,
        file_offset: u64,
        size: usize,
        key: &[u8; USER_KEY_SIZE],
    ) -> Result<Self> {
        let path = path.as_ref();
        ensure!(size > 0, "cannot map zero bytes");
        ensure!(
            size % PAGE_SIZE == 0 && file_offset % PAGE_SIZE as u64 == 0,
            "mapping window must be page-aligned"
        );

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .wrap_err_with(|| format!("failed to open encrypted file '{}'", path.display()))?;

        let disk_size = file.metadata().map_err(StorageError::Io)?.len();
        if disk_size > 0 && disk_size < (PAGE_SIZE * 2) as u64 {
            // A non-empty encrypted file holds at least one metadata block
            // and one data block.
            return Err(StorageError::InvalidFile {
                reason: format!("{} bytes is smaller than one encrypted page", disk_size),
            }
            .into());
        }

        let id = file_id(path, &file)?;
        let buf = MmapMut::map_anon(size).map_err(|e| StorageError::from_map_error(e, size))?;

        let mut registry = REGISTRY.lock();
        let shared = match registry.iter().find(|(fid, _)| *fid == id) {
            Some((_, shared)) => Arc::clone(shared),
            None => {
                let shared = Arc::new(SharedFile {
                    state: Mutex::new(SharedFileInfo {
                        file,
                        cryptor: PageCryptor::new(key),
                        mappings: Vec::new(),
                    }),
                });
                registry.push((id.clone(), Arc::clone(&shared)));
                debug!(path = %path.display(), "registered encrypted file");
                shared
            }
        };

        let page_count = size / PAGE_SIZE;
        let inner = Box::new(MappingInner {
            shared: Arc::clone(&shared),
            buf,
            file_offset,
            page_count,
            up_to_date: vec![false; page_count],
            dirty: vec![false; page_count],
        });
        let inner = NonNull::from(Box::leak(inner));

        {
            let mut state = shared.state.lock();
            state.cryptor.set_file_size(file_offset + size as u64);
            state.mappings.push(inner);
        }
        drop(registry);

        Ok(EncryptedFileMapping { inner })
    }

    fn inner(&self) -> &MappingInner {
        // SAFETY: the box lives until drop(); shared mutation only happens
        // under the file lock, which barrier entry points take.
        unsafe { self.inner.as_ref() }
    }

    /// Runs `f` with the file lock held and exclusive access to this
    /// mapping's state. All state transitions go through here.
    fn with_lock<R>(
        &mut self,
        f: impl FnOnce(&mut MappingInner, &mut SharedFileInfo) -> Result<R>,
    ) -> Result<R> {
        let shared = Arc::clone(&self.inner().shared);
        let mut state = shared.state.lock();
        // SAFETY: we hold the file lock, so no sibling is touching this
        // mapping's state; &mut through the pointer is exclusive.
        let inner = unsafe { &mut *self.inner.as_ptr() };
        f(inner, &mut state)
    }

    pub fn len(&self) -> usize {
        self.inner().page_count * PAGE_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn page_count(&self) -> usize {
        self.inner().page_count
    }

    pub fn file_offset(&self) -> u64 {
        self.inner().file_offset
    }

    fn page_range(&self, offset: usize, size: usize) -> Result<(usize, usize)> {
        ensure!(size > 0, "empty byte range");
        ensure!(
            offset + size <= self.len(),
            "range {offset}..{} outside mapping of {} bytes",
            offset + size,
            self.len()
        );
        Ok((offset / PAGE_SIZE, (offset + size - 1) / PAGE_SIZE))
    }

    /// Makes `[offset, offset + size)` readable: pages not up to date are
    /// copied from an up-to-date sibling or decrypted from disk.
    pub fn read_barrier(&mut self, offset: usize, size: usize) -> Result<()> {
        let (first, last) = self.page_range(offset, size)?;
        self.with_lock(|inner, state| {
            for page in first..=last {
                if inner.up_to_date[page] {
                    continue;
                }
                let abs_page = inner.first_page() + page;

                // Prefer a sibling's decrypted copy over a disk round-trip.
                let mut copied = false;
                for &sibling_ptr in &state.mappings {
                    if sibling_ptr == NonNull::from(&*inner) {
                        continue;
                    }
                    // SAFETY: sibling state is only touched under the file
                    // lock, which we hold.
                    let sibling = unsafe { &*sibling_ptr.as_ptr() };
                    if let Some(sp) = sibling.local_page(abs_page) {
                        if sibling.up_to_date[sp] {
                            let from = sibling.page_slice(sp).as_ptr();
                            // SAFETY: distinct mappings own distinct anon
                            // buffers; the ranges cannot overlap.
                            unsafe {
                                std::ptr::copy_nonoverlapping(
                                    from,
                                    inner.page_slice_mut(page).as_mut_ptr(),
                                    PAGE_SIZE,
                                );
                            }
                            copied = true;
                            break;
                        }
                    }
                }

                if !copied {
                    let pos = (abs_page * PAGE_SIZE) as u64;
                    let dst = &mut inner.buf[page * PAGE_SIZE..(page + 1) * PAGE_SIZE];
                    let SharedFileInfo { file, cryptor, .. } = state;
                    if !cryptor.read(file, pos, dst)? {
                        // Never written: present as zero-fill.
                        dst.fill(0);
                    }
                }
                inner.up_to_date[page] = true;
            }
            Ok(())
        })
    }

    /// Declares `[offset, offset + size)` modified in memory. Every covered
    /// page must have passed a read barrier first.
    pub fn write_barrier(&mut self, offset: usize, size: usize) -> Result<()> {
        let (first, last) = self.page_range(offset, size)?;
        self.with_lock(|inner, state| {
            for page in first..=last {
                ensure!(
                    inner.up_to_date[page],
                    "write barrier on page {page} without a prior read barrier"
                );
                let abs_page = inner.first_page() + page;
                let siblings: Vec<NonNull<MappingInner>> = state.mappings.clone();
                for sibling_ptr in siblings {
                    if sibling_ptr == NonNull::from(&*inner) {
                        continue;
                    }
                    // SAFETY: sibling state is only touched under the file
                    // lock, which we hold.
                    let sibling = unsafe { &mut *sibling_ptr.as_ptr() };
                    sibling.mark_outdated(abs_page, state)?;
                }
                inner.dirty[page] = true;
            }
            Ok(())
        })
    }

    /// Reads bytes through the read barrier.
    pub fn read(&mut self, offset: usize, out: &mut [u8]) -> Result<()> {
        self.read_barrier(offset, out.len())?;
        let len = out.len();
        self.with_lock(|inner, _| {
            out.copy_from_slice(&inner.buf[offset..offset + len]);
            Ok(())
        })
    }

    /// Writes bytes: read barrier on the covered pages, copy, write
    /// barrier.
    pub fn write(&mut self, offset: usize, data: &[u8]) -> Result<()> {
        self.read_barrier(offset, data.len())?;
        self.with_lock(|inner, _| {
            inner.buf[offset..offset + data.len()].copy_from_slice(data);
            Ok(())
        })?;
        self.write_barrier(offset, data.len())
    }

    /// Encrypt-writes every dirty page back to the file.
    pub fn flush(&mut self) -> Result<()> {
        self.with_lock(|inner, state| inner.flush(state))
    }

    /// Durability point: flushed ciphertext reaches the device.
    pub fn sync(&mut self) -> Result<()> {
        self.with_lock(|_, state| {
            state.file.sync_all().map_err(StorageError::Io)?;
            Ok(())
        })
    }

    /// Remaps the window: flushes local writes, replaces the buffer, and
    /// resets page state. Contents must be re-read through the barrier.
    pub fn set(&mut self, file_offset: u64, size: usize) -> Result<()> {
        ensure!(size > 0, "cannot map zero bytes");
        ensure!(
            size % PAGE_SIZE == 0 && file_offset % PAGE_SIZE as u64 == 0,
            "mapping window must be page-aligned"
        );
        let buf = MmapMut::map_anon(size).map_err(|e| StorageError::from_map_error(e, size))?;
        self.with_lock(|inner, state| {
            inner.flush(state)?;
            state.cryptor.set_file_size(file_offset + size as u64);
            inner.buf = buf;
            inner.file_offset = file_offset;
            inner.page_count = size / PAGE_SIZE;
            inner.up_to_date = vec![false; inner.page_count];
            inner.dirty = vec![false; inner.page_count];
            Ok(())
        })
    }
}

impl Drop for EncryptedFileMapping {
    fn drop(&mut self) {
        // Best effort: persist local writes, then unregister. The last
        // mapping of a file retires its registry entry, closing the handle.
        let _ = self.flush();
        let _ = self.sync();

        let mut registry = REGISTRY.lock();
        let shared = Arc::clone(&self.inner().shared);
        let now_empty = {
            let mut state = shared.state.lock();
            state.mappings.retain(|&p| p != self.inner);
            state.mappings.is_empty()
        };
        if now_empty {
            registry.retain(|(_, entry)| !Arc::ptr_eq(entry, &shared));
            debug!("last mapping dropped, retiring encrypted file entry");
        }
        drop(registry);

        // SAFETY: the pointer came from Box::leak in map() and is no longer
        // reachable from the registry.
        unsafe { drop(Box::from_raw(self.inner.as_ptr())) };
    }
}

impl std::fmt::Debug for EncryptedFileMapping {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner();
        f.debug_struct("EncryptedFileMapping")
            .field("file_offset", &inner.file_offset)
            .field("page_count", &inner.page_count)
            .finish()
    }
}
