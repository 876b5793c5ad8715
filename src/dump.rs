//! The raw physical-memory image. An opaque, randomly-readable byte source;
//! offsets correspond 1:1 to physical memory addresses.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::sync::Mutex;

/// A seekable byte source whose offsets are physical addresses. Must be
/// safe to call concurrently from the builder's worker pool — physical
/// reads, unlike range-tree inserts, are not covered by any of the five
/// named locks.
pub trait Dump: Send + Sync {
    /// Reads exactly `buf.len()` bytes starting at `offset`. Returns
    /// `Ok(false)` (not an error) when `offset..offset+len` runs past the
    /// end of the device, since unreadable targets are a normal, expected
    /// outcome on the scoring path (`memory_access` only at the caller's
    /// discretion — see `VirtualMemory::safe_seek`).
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<bool>;

    /// Total size of the backing device, in bytes.
    fn len(&self) -> u64;

    #[must_use]
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// A dump backed by an in-memory byte slice, for tests and small fixtures.
pub struct SliceDump {
    bytes: Vec<u8>,
}

impl SliceDump {
    #[must_use]
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }
}

impl Dump for SliceDump {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<bool> {
        let Ok(start) = usize::try_from(offset) else { return Ok(false) };
        let Some(end) = start.checked_add(buf.len()) else { return Ok(false) };
        if end > self.bytes.len() {
            return Ok(false);
        }
        buf.copy_from_slice(&self.bytes[start..end]);
        Ok(true)
    }

    fn len(&self) -> u64 {
        self.bytes.len() as u64
    }
}

/// A dump backed by a real file. Reads are serialized through a mutex
/// around `seek` + `read_exact`; platforms with positioned reads could
/// specialize this, but the generic path is correct everywhere and the
/// device read is not expected to be the bottleneck relative to page
/// walks and rule dispatch.
pub struct FileDump {
    file: Mutex<File>,
    len: u64,
}

impl FileDump {
    pub fn open(path: impl AsRef<std::path::Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let len = file.metadata()?.len();
        Ok(Self { file: Mutex::new(file), len })
    }
}

impl Dump for FileDump {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> std::io::Result<bool> {
        if offset.checked_add(buf.len() as u64).is_none_or(|end| end > self.len) {
            return Ok(false);
        }
        let mut file = self.file.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(true)
    }

    fn len(&self) -> u64 {
        self.len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slice_dump_reads_in_range() {
        let dump = SliceDump::new((0u8..16).collect());
        let mut buf = [0u8; 4];
        assert!(dump.read_at(4, &mut buf).unwrap());
        assert_eq!(buf, [4, 5, 6, 7]);
    }

    #[test]
    fn slice_dump_rejects_out_of_range() {
        let dump = SliceDump::new(vec![0; 8]);
        let mut buf = [0u8; 4];
        assert!(!dump.read_at(6, &mut buf).unwrap());
    }
}
