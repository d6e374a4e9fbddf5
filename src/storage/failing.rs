use super::{FileId, IoCounters, MappedRegion, OpenMode, StorageIo};
use crate::error::io_error;
use std::{
    io::{self, SeekFrom},
    path::Path,
};

/// `StorageIo` that fails every file operation.
///
/// Free space is still reported, so the space guard can be driven independently of I/O success.
pub struct FailingStorage {
    free_space: u64,
}

impl FailingStorage {
    pub fn new(free_space: u64) -> FailingStorage { FailingStorage { free_space } }
}

fn injected() -> io::Error { io_error("injected storage failure") }

impl StorageIo for FailingStorage {
    fn open(&self, _path: &Path, _mode: OpenMode) -> io::Result<FileId> { Err(injected()) }

    fn close(&self, _fd: FileId) -> io::Result<()> { Err(injected()) }

    fn read(&self, _fd: FileId, _buf: &mut [u8]) -> io::Result<usize> { Err(injected()) }

    fn write(&self, _fd: FileId, _buf: &[u8]) -> io::Result<usize> { Err(injected()) }

    fn seek(&self, _fd: FileId, _pos: SeekFrom) -> io::Result<u64> { Err(injected()) }

    fn tell(&self, _fd: FileId) -> io::Result<u64> { Err(injected()) }

    fn truncate(&self, _fd: FileId, _len: u64) -> io::Result<()> { Err(injected()) }

    fn map(&self, _fd: FileId, _offset: u64, _len: usize, _writable: bool) -> io::Result<MappedRegion> {
        Err(injected())
    }

    fn unmap(&self, _region: MappedRegion) -> io::Result<()> { Err(injected()) }

    fn flush(&self, _region: &MappedRegion, _immediate: bool) -> io::Result<()> { Err(injected()) }

    fn available_space(&self, _path: &Path) -> io::Result<u64> { Ok(self.free_space) }

    fn counters(&self) -> IoCounters { IoCounters::default() }

    fn dispose(&self) {}
}
