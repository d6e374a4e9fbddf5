//! Pluggable access to the files backing counters.
//!
//! Everything the store reads from or writes to disk goes through a `StorageIo` implementation.
//! `FileStorage` talks to the real filesystem, while `FailingStorage` fails every operation and
//! exists so that I/O failure and disk exhaustion can be exercised without touching a disk.
use memmap2::{Mmap, MmapMut};
use serde::Serialize;
use std::{
    io::{self, SeekFrom},
    path::Path,
};

mod failing;
mod file;

pub use self::{failing::FailingStorage, file::FileStorage};

/// Handle to a file opened through a `StorageIo`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct FileId(pub(crate) u64);

/// How a file should be opened.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct OpenMode {
    pub(crate) writable: bool,
    pub(crate) create: bool,
    pub(crate) owner: Option<u32>,
}

impl OpenMode {
    /// Open an existing file for reading.
    pub fn read_only() -> OpenMode {
        OpenMode {
            writable: false,
            create: false,
            owner: None,
        }
    }

    /// Open a file for reading and writing, creating it and its parent directories if needed.
    pub fn create() -> OpenMode {
        OpenMode {
            writable: true,
            create: true,
            owner: None,
        }
    }

    /// Sets the user that should own anything created by the open.
    pub fn owner(mut self, uid: Option<u32>) -> OpenMode {
        self.owner = uid;
        self
    }
}

/// Operation counts reported by a `StorageIo`.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct IoCounters {
    pub maps: u64,
    pub unmaps: u64,
    pub opens: u64,
    pub closes: u64,
}

enum Mapping {
    ReadOnly(Mmap),
    Writable(MmapMut),
}

/// A region of a file mapped into memory.
///
/// The mapping is released by handing the region back to `StorageIo::unmap`, or by dropping it.
pub struct MappedRegion {
    fd: FileId,
    offset: u64,
    mapping: Mapping,
}

impl MappedRegion {
    pub fn read_only(fd: FileId, offset: u64, mmap: Mmap) -> MappedRegion {
        MappedRegion {
            fd,
            offset,
            mapping: Mapping::ReadOnly(mmap),
        }
    }

    pub fn writable(fd: FileId, offset: u64, mmap: MmapMut) -> MappedRegion {
        MappedRegion {
            fd,
            offset,
            mapping: Mapping::Writable(mmap),
        }
    }

    /// The file this region was mapped from.
    pub fn fd(&self) -> FileId { self.fd }

    /// Offset of the region within its file.
    pub fn offset(&self) -> u64 { self.offset }

    pub fn len(&self) -> usize { self.as_slice().len() }

    pub fn is_empty(&self) -> bool { self.len() == 0 }

    pub fn is_writable(&self) -> bool { matches!(self.mapping, Mapping::Writable(_)) }

    pub fn as_slice(&self) -> &[u8] {
        match &self.mapping {
            Mapping::ReadOnly(m) => &m[..],
            Mapping::Writable(m) => &m[..],
        }
    }

    /// Mutable view of the region, or `None` if it was mapped read-only.
    pub fn as_mut_slice(&mut self) -> Option<&mut [u8]> {
        match &mut self.mapping {
            Mapping::ReadOnly(_) => None,
            Mapping::Writable(m) => Some(&mut m[..]),
        }
    }

    pub(crate) fn flush(&self, immediate: bool) -> io::Result<()> {
        match &self.mapping {
            Mapping::ReadOnly(_) => Ok(()),
            Mapping::Writable(m) if immediate => m.flush(),
            Mapping::Writable(m) => m.flush_async(),
        }
    }
}

/// File and memory-map operations used by the store.
///
/// Every operation reports failure through its `io::Result`; callers are expected to check and
/// never assume a partially successful call.
pub trait StorageIo: Send + Sync {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<FileId>;

    fn close(&self, fd: FileId) -> io::Result<()>;

    fn read(&self, fd: FileId, buf: &mut [u8]) -> io::Result<usize>;

    fn write(&self, fd: FileId, buf: &[u8]) -> io::Result<usize>;

    fn seek(&self, fd: FileId, pos: SeekFrom) -> io::Result<u64>;

    fn tell(&self, fd: FileId) -> io::Result<u64>;

    /// Sets the length of the file, growing or shrinking it.
    fn truncate(&self, fd: FileId, len: u64) -> io::Result<()>;

    fn map(&self, fd: FileId, offset: u64, len: usize, writable: bool) -> io::Result<MappedRegion>;

    fn unmap(&self, region: MappedRegion) -> io::Result<()>;

    /// Writes dirty pages of `region` back to its file, waiting for completion if `immediate`.
    fn flush(&self, region: &MappedRegion, immediate: bool) -> io::Result<()>;

    /// Bytes available to unprivileged users on the volume holding `path`.
    fn available_space(&self, path: &Path) -> io::Result<u64>;

    fn counters(&self) -> IoCounters;

    /// Closes everything this instance still has open.
    fn dispose(&self);
}
