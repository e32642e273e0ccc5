/*
 * Growable memory-mapped file facade.
 *
 * Gives the allocators and the B+tree position-free `read_at`/`write_at`/`append`
 * over an absolute byte offset, backed by an `MmapMut` that is grown on demand.
 * Every write is flushed (via `flush_range`) before it returns, so "the operation
 * returns only once its writes have reached the host I/O layer" holds without
 * forcing a full-mapping `msync` on every call.
 */
use std::cmp::max;
use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap::MmapMut;

use crate::error::{Error, Result};

pub(crate) struct GrowableFile {
    backing: File,
    map: MmapMut,
    growth_increment: usize,
    /// Logical end of written content, tracked independently of the mapping's
    /// (page-rounded, pre-grown) capacity. Only `append` advances this.
    cursor: u64,
}

impl GrowableFile {
    /// Opens `path`, creating it (and mapping `initial_len` bytes) if it doesn't exist.
    /// Returns the facade along with whether the file already existed, so the caller
    /// can decide whether to read an existing header or write a fresh one.
    pub(crate) fn open(path: &Path, initial_len: usize, growth_increment: usize) -> Result<(Self, bool)> {
        let existed = path.exists();
        let backing = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;

        let current_len = backing.metadata()?.len() as usize;
        let target_len = if existed {
            max(current_len, 1)
        } else {
            max(initial_len, 1)
        };
        if current_len < target_len {
            backing.set_len(target_len as u64)?;
        }

        let map = unsafe { MmapMut::map_mut(&backing)? };
        let cursor = if existed { current_len as u64 } else { 0 };
        Ok((
            GrowableFile {
                backing,
                map,
                growth_increment,
                cursor,
            },
            existed,
        ))
    }

    fn ensure_capacity(&mut self, len: usize) -> Result<()> {
        let cur_size = self.map.len();
        if cur_size < len {
            // Double up to growth_increment, then increment linearly by at least
            // growth_increment -- same policy as the teacher crate's ExtensibleMmapMut.
            let new_size = max(
                len,
                if cur_size > self.growth_increment {
                    cur_size + self.growth_increment
                } else {
                    max(cur_size * 2, self.growth_increment)
                },
            );
            log::trace!("growing mapping from {} to {} bytes", cur_size, new_size);
            self.backing.set_len(new_size as u64)?;
            self.map.flush_async()?;
            let mut new_map = unsafe { MmapMut::map_mut(&self.backing)? };
            std::mem::swap(&mut self.map, &mut new_map);
            debug_assert!(self.map.len() >= len);
        }
        Ok(())
    }

    pub(crate) fn read_at(&self, offset: u64, len: usize) -> Result<&[u8]> {
        let start = offset as usize;
        let end = match start.checked_add(len) {
            Some(end) => end,
            None => {
                log::warn!("offset overflow reading {} bytes at {}", len, offset);
                return Err(Error::Corrupt(format!("offset overflow reading {} bytes at {}", len, offset)));
            }
        };
        if end > self.map.len() {
            log::warn!(
                "read of {} bytes at offset {} runs past end of file ({} bytes)",
                len,
                offset,
                self.map.len()
            );
            return Err(Error::Corrupt(format!(
                "read of {} bytes at offset {} runs past end of file ({} bytes)",
                len,
                offset,
                self.map.len()
            )));
        }
        Ok(&self.map[start..end])
    }

    pub(crate) fn write_at(&mut self, offset: u64, bytes: &[u8]) -> Result<()> {
        let start = offset as usize;
        let end = start + bytes.len();
        self.ensure_capacity(end)?;
        self.map[start..end].copy_from_slice(bytes);
        self.map.flush_range(start, bytes.len())?;
        Ok(())
    }

    /// Writes `bytes` past the current logical end of file, returning the offset it
    /// was written at. Used only during header initialisation, where the allocators'
    /// own free-list bookkeeping hasn't taken over yet.
    pub(crate) fn append(&mut self, bytes: &[u8]) -> Result<u64> {
        let offset = self.cursor;
        self.write_at(offset, bytes)?;
        self.cursor += bytes.len() as u64;
        Ok(offset)
    }
}
