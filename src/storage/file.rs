use super::{FileId, IoCounters, MappedRegion, OpenMode, StorageIo};
use crate::error::io_error;
use fnv::FnvBuildHasher;
use hashbrown::HashMap;
use log::debug;
use memmap2::MmapOptions;
use std::{
    fs::{self, File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex, MutexGuard,
    },
};

/// `StorageIo` backed by the local filesystem.
pub struct FileStorage {
    files: Mutex<HashMap<FileId, File, FnvBuildHasher>>,
    next_id: AtomicU64,
    maps: AtomicU64,
    unmaps: AtomicU64,
    opens: AtomicU64,
    closes: AtomicU64,
}

impl FileStorage {
    pub fn new() -> FileStorage {
        FileStorage {
            files: Mutex::new(HashMap::default()),
            next_id: AtomicU64::new(1),
            maps: AtomicU64::new(0),
            unmaps: AtomicU64::new(0),
            opens: AtomicU64::new(0),
            closes: AtomicU64::new(0),
        }
    }

    fn files(&self) -> io::Result<MutexGuard<'_, HashMap<FileId, File, FnvBuildHasher>>> {
        self.files.lock().map_err(|_| io_error("file table poisoned"))
    }

    fn with_file<R>(&self, fd: FileId, f: impl FnOnce(&mut File) -> io::Result<R>) -> io::Result<R> {
        let mut files = self.files()?;
        match files.get_mut(&fd) {
            Some(file) => f(file),
            None => Err(io_error("unknown file handle")),
        }
    }
}

impl Default for FileStorage {
    fn default() -> FileStorage { FileStorage::new() }
}

impl StorageIo for FileStorage {
    fn open(&self, path: &Path, mode: OpenMode) -> io::Result<FileId> {
        let existed = path.exists();
        if mode.create {
            if let Some(parent) = path.parent() {
                create_dirs(parent, mode.owner)?;
            }
        }

        let file = OpenOptions::new()
            .read(true)
            .write(mode.writable)
            .create(mode.create)
            .open(path)?;
        if !existed {
            set_owner(path, mode.owner)?;
        }

        let fd = FileId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.files()?.insert(fd, file);
        self.opens.fetch_add(1, Ordering::Relaxed);
        debug!("opened {} as {:?}", path.display(), fd);
        Ok(fd)
    }

    fn close(&self, fd: FileId) -> io::Result<()> {
        match self.files()?.remove(&fd) {
            Some(_) => {
                self.closes.fetch_add(1, Ordering::Relaxed);
                Ok(())
            },
            None => Err(io_error("unknown file handle")),
        }
    }

    fn read(&self, fd: FileId, buf: &mut [u8]) -> io::Result<usize> { self.with_file(fd, |f| f.read(buf)) }

    fn write(&self, fd: FileId, buf: &[u8]) -> io::Result<usize> { self.with_file(fd, |f| f.write(buf)) }

    fn seek(&self, fd: FileId, pos: SeekFrom) -> io::Result<u64> { self.with_file(fd, |f| f.seek(pos)) }

    fn tell(&self, fd: FileId) -> io::Result<u64> { self.with_file(fd, |f| f.seek(SeekFrom::Current(0))) }

    fn truncate(&self, fd: FileId, len: u64) -> io::Result<()> { self.with_file(fd, |f| f.set_len(len)) }

    fn map(&self, fd: FileId, offset: u64, len: usize, writable: bool) -> io::Result<MappedRegion> {
        let region = self.with_file(fd, |f| {
            let mut options = MmapOptions::new();
            options.offset(offset).len(len);
            // Safety: the file stays open in our table for as long as the store holds the
            // mapping, and counter files are only ever resized before they are mapped.
            unsafe {
                if writable {
                    options.map_mut(&*f).map(|m| MappedRegion::writable(fd, offset, m))
                } else {
                    options.map(&*f).map(|m| MappedRegion::read_only(fd, offset, m))
                }
            }
        })?;

        self.maps.fetch_add(1, Ordering::Relaxed);
        Ok(region)
    }

    fn unmap(&self, region: MappedRegion) -> io::Result<()> {
        drop(region);
        self.unmaps.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn flush(&self, region: &MappedRegion, immediate: bool) -> io::Result<()> { region.flush(immediate) }

    fn available_space(&self, path: &Path) -> io::Result<u64> { disk_space_for_path(path) }

    fn counters(&self) -> IoCounters {
        IoCounters {
            maps: self.maps.load(Ordering::Relaxed),
            unmaps: self.unmaps.load(Ordering::Relaxed),
            opens: self.opens.load(Ordering::Relaxed),
            closes: self.closes.load(Ordering::Relaxed),
        }
    }

    fn dispose(&self) {
        if let Ok(mut files) = self.files() {
            let count = files.len() as u64;
            files.clear();
            self.closes.fetch_add(count, Ordering::Relaxed);
        }
    }
}

/// Creates `dir` and any missing parents, handing the new directories to `owner`.
fn create_dirs(dir: &Path, owner: Option<u32>) -> io::Result<()> {
    if dir.as_os_str().is_empty() || dir.is_dir() {
        return Ok(());
    }

    if let Some(parent) = dir.parent() {
        create_dirs(parent, owner)?;
    }

    match fs::create_dir(dir) {
        Ok(()) => set_owner(dir, owner),
        Err(ref e) if e.kind() == io::ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn set_owner(path: &Path, owner: Option<u32>) -> io::Result<()> {
    match owner {
        // Safety: geteuid has no preconditions and cannot fail.
        Some(uid) if uid != unsafe { libc::geteuid() } => std::os::unix::fs::chown(path, Some(uid), None),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
fn set_owner(_path: &Path, _owner: Option<u32>) -> io::Result<()> { Ok(()) }

#[cfg(unix)]
#[allow(clippy::unnecessary_cast)]
fn disk_space_for_path(path: &Path) -> io::Result<u64> {
    use std::{ffi::CString, os::unix::ffi::OsStrExt};

    let c_path = CString::new(path.as_os_str().as_bytes()).map_err(|_| io_error("path contains a nul byte"))?;
    unsafe {
        let mut stat: libc::statvfs = std::mem::zeroed();
        if libc::statvfs(c_path.as_ptr(), &mut stat) == 0 {
            Ok((stat.f_bavail as u64).saturating_mul(stat.f_frsize as u64))
        } else {
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(not(unix))]
fn disk_space_for_path(_path: &Path) -> io::Result<u64> { Err(io_error("free space query unsupported")) }

#[cfg(test)]
mod tests {
    use super::FileStorage;
    use crate::storage::{OpenMode, StorageIo};
    use std::io::SeekFrom;

    #[test]
    fn test_file_storage_read_write() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("a").join("b").join("data.bkt");
        let io = FileStorage::new();

        let fd = io.open(&path, OpenMode::create()).unwrap();
        assert_eq!(io.write(fd, b"hello world").unwrap(), 11);
        assert_eq!(io.tell(fd).unwrap(), 11);
        assert_eq!(io.seek(fd, SeekFrom::Start(6)).unwrap(), 6);

        let mut buf = [0u8; 5];
        assert_eq!(io.read(fd, &mut buf).unwrap(), 5);
        assert_eq!(&buf, b"world");

        io.truncate(fd, 5).unwrap();
        assert_eq!(io.seek(fd, SeekFrom::End(0)).unwrap(), 5);
        io.close(fd).unwrap();

        assert!(io.close(fd).is_err());
        assert!(io.read(fd, &mut buf).is_err());
    }

    #[test]
    fn test_file_storage_map_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mapped.bkt");
        let io = FileStorage::new();

        let fd = io.open(&path, OpenMode::create()).unwrap();
        io.truncate(fd, 64).unwrap();

        let mut region = io.map(fd, 0, 64, true).unwrap();
        assert_eq!(region.len(), 64);
        region.as_mut_slice().unwrap()[..4].copy_from_slice(b"tick");
        io.flush(&region, true).unwrap();
        io.unmap(region).unwrap();

        let region = io.map(fd, 0, 64, false).unwrap();
        assert!(!region.is_writable());
        assert_eq!(&region.as_slice()[..4], b"tick");
        io.unmap(region).unwrap();
        io.close(fd).unwrap();

        let counters = io.counters();
        assert_eq!(counters.maps, 2);
        assert_eq!(counters.unmaps, 2);
        assert_eq!(counters.opens, 1);
        assert_eq!(counters.closes, 1);
    }

    #[test]
    fn test_file_storage_open_missing_read_only() {
        let dir = tempfile::tempdir().unwrap();
        let io = FileStorage::new();
        assert!(io.open(&dir.path().join("nope"), OpenMode::read_only()).is_err());
        assert_eq!(io.counters().opens, 0);
    }

    #[test]
    fn test_file_storage_available_space() {
        let dir = tempfile::tempdir().unwrap();
        let io = FileStorage::new();
        assert!(io.available_space(dir.path()).is_ok());
        assert!(io.available_space(&dir.path().join("missing")).is_err());
    }

    #[test]
    fn test_file_storage_dispose() {
        let dir = tempfile::tempdir().unwrap();
        let io = FileStorage::new();
        let a = io.open(&dir.path().join("a"), OpenMode::create()).unwrap();
        let _ = io.open(&dir.path().join("b"), OpenMode::create()).unwrap();

        io.dispose();
        assert_eq!(io.counters().closes, 2);
        assert!(io.tell(a).is_err());
    }
}
