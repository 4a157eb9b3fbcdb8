//! Thin platform layer under the lock table.
//!
//! Every call surfaces the native error code through [`Error::Os`]; nothing
//! here retries except on `EINTR`.

use std::alloc::{self, Layout};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io;
use std::os::raw::{c_int, c_void};
use std::os::unix::fs::{FileExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::AsRawFd;
use std::path::Path;
use std::ptr::NonNull;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::Instant;

use lazy_static::lazy_static;
use memmap2::{MmapMut, MmapOptions};
use once_cell::sync::Lazy;

use crate::error::{Error, IntoResult, Result};

#[cfg(target_os = "linux")]
const F_SETLK: c_int = libc::F_OFD_SETLK;
#[cfg(not(target_os = "linux"))]
const F_SETLK: c_int = libc::F_SETLK;

static SYS_PAGE_SIZE: Lazy<usize> = Lazy::new(|| {
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size > 0 {
        size as usize
    } else {
        4096
    }
});

/// How a file is opened
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenMode {
    ReadOnly,
    ReadWrite,
    /// Read-write, creating the file if it is missing
    Create,
}

/// Durability requested from a sync call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    /// File data only
    Data,
    /// File data and metadata
    Full,
}

pub fn open_file(path: &Path, mode: OpenMode) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true);
    match mode {
        OpenMode::ReadOnly => {}
        OpenMode::ReadWrite => {
            options.write(true);
        }
        OpenMode::Create => {
            options.write(true).create(true).mode(0o644);
        }
    }
    Ok(options.open(path)?)
}

/// Read at `offset` until `buf` is full or end of file, returning the byte count.
pub fn pread(file: &File, buf: &mut [u8], offset: u64) -> Result<usize> {
    let mut done = 0;
    while done < buf.len() {
        match file.read_at(&mut buf[done..], offset + done as u64) {
            Ok(0) => break,
            Ok(n) => done += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e.into()),
        }
    }
    Ok(done)
}

pub fn pwrite(file: &File, buf: &[u8], offset: u64) -> Result<()> {
    Ok(file.write_all_at(buf, offset)?)
}

pub fn file_size(file: &File) -> Result<u64> {
    Ok(file.metadata()?.len())
}

pub fn ftruncate(file: &File, length: u64) -> Result<()> {
    Ok(file.set_len(length)?)
}

pub fn filesync(file: &File, mode: SyncMode) -> Result<()> {
    match mode {
        SyncMode::Data => file.sync_data()?,
        SyncMode::Full => file.sync_all()?,
    }
    Ok(())
}

/// Map `length` bytes of `file` shared and writable.
pub fn mmap(file: &File, length: usize) -> Result<MmapMut> {
    // SAFETY: the mapping is shared with other processes on purpose; every
    // access to it goes through atomics laid out by the lock region.
    let map = unsafe { MmapOptions::new().len(length).map_mut(file)? };
    Ok(map)
}

pub fn msync(map: &MmapMut, asynchronous: bool) -> Result<()> {
    if asynchronous {
        map.flush_async()?;
    } else {
        map.flush()?;
    }
    Ok(())
}

/// Pin the mapped pages in RAM.
pub fn mlock(map: &MmapMut) -> Result<()> {
    unsafe { libc::mlock(map.as_ptr() as *const c_void, map.len()) }.into_result()
}

pub fn munlock(map: &MmapMut) -> Result<()> {
    unsafe { libc::munlock(map.as_ptr() as *const c_void, map.len()) }.into_result()
}

/// Size of a memory page for the system
pub fn syspagesize() -> usize {
    *SYS_PAGE_SIZE
}

pub fn getpid() -> u32 {
    std::process::id()
}

/// Identity of the calling thread, unique among live threads of a process
pub fn thread_self() -> u64 {
    unsafe { libc::pthread_self() as usize as u64 }
}

/// Zeroed heap buffer with a caller-chosen alignment
pub struct AlignedBuf {
    ptr: NonNull<u8>,
    len: usize,
    layout: Layout,
}

// SAFETY: the buffer is uniquely owned
unsafe impl Send for AlignedBuf {}
unsafe impl Sync for AlignedBuf {}

impl AlignedBuf {
    pub fn new(alignment: usize, len: usize) -> Result<Self> {
        let layout =
            Layout::from_size_align(len.max(1), alignment).map_err(|_| Error::Os(libc::EINVAL))?;
        let ptr = unsafe { alloc::alloc_zeroed(layout) };
        let ptr = NonNull::new(ptr).ok_or(Error::Os(libc::ENOMEM))?;
        Ok(AlignedBuf { ptr, len, layout })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr.as_ptr(), self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }
}

impl Drop for AlignedBuf {
    fn drop(&mut self) {
        unsafe { alloc::dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

/// In-process mutex/condition pair whose ownership is not tied to a guard.
///
/// A thread takes the gate with [`Gate::acquire`] and any thread may hand it
/// back with [`Gate::release`], which lets a lock outlive the stack frame
/// that took it.
#[derive(Debug, Default)]
pub struct Gate {
    held: Mutex<bool>,
    released: Condvar,
}

impl Gate {
    pub fn new() -> Self {
        Gate::default()
    }

    /// Block until the gate is free, or fail with `Timeout` at `deadline`.
    pub fn acquire(&self, deadline: Option<Instant>) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        while *held {
            held = match deadline {
                None => self
                    .released
                    .wait(held)
                    .unwrap_or_else(PoisonError::into_inner),
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return Err(Error::Timeout);
                    }
                    self.released
                        .wait_timeout(held, deadline - now)
                        .unwrap_or_else(PoisonError::into_inner)
                        .0
                }
            };
        }
        *held = true;
        Ok(())
    }

    pub fn try_acquire(&self) -> Result<()> {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        if *held {
            return Err(Error::Busy);
        }
        *held = true;
        Ok(())
    }

    pub fn release(&self) {
        let mut held = self.held.lock().unwrap_or_else(PoisonError::into_inner);
        *held = false;
        drop(held);
        self.released.notify_one();
    }
}

// Record locks on single bytes of a file. On Linux these are
// open-file-description locks, so two handles inside one process exclude
// each other like two processes do. Elsewhere classic fcntl locks are per
// process, and `OPEN_LOCK_FILES` keeps a process to one handle per file.

/// Whether record locks are owned by the open file description
pub const RECORD_LOCKS_PER_HANDLE: bool = cfg!(target_os = "linux");

fn record_lock(file: &File, cmd: c_int, kind: c_int, start: u64, len: u64) -> Result<()> {
    let mut lock: libc::flock = unsafe { std::mem::zeroed() };
    lock.l_type = kind as _;
    lock.l_whence = libc::SEEK_SET as _;
    lock.l_start = start as _;
    lock.l_len = len as _;
    loop {
        let rc = unsafe { libc::fcntl(file.as_raw_fd(), cmd, &mut lock) };
        if rc == 0 {
            return Ok(());
        }
        match Error::last_os_error() {
            Error::Os(libc::EINTR) => continue,
            err => return Err(err),
        }
    }
}

fn try_record_lock(file: &File, kind: c_int, byte: u64) -> Result<bool> {
    match record_lock(file, F_SETLK, kind, byte, 1) {
        Ok(()) => Ok(true),
        Err(Error::Os(code)) if code == libc::EAGAIN || code == libc::EACCES => Ok(false),
        Err(err) => Err(err),
    }
}

/// Try to lock `byte` exclusively; `Ok(false)` when anyone else holds it.
pub fn try_lock_exclusive(file: &File, byte: u64) -> Result<bool> {
    try_record_lock(file, libc::F_WRLCK as c_int, byte)
}

/// Try to lock `byte` shared; `Ok(false)` while it is held exclusively.
pub fn try_lock_shared(file: &File, byte: u64) -> Result<bool> {
    try_record_lock(file, libc::F_RDLCK as c_int, byte)
}

/// Convert an exclusive lock on `byte` into a shared one without releasing it.
pub fn downgrade(file: &File, byte: u64) -> Result<()> {
    record_lock(file, F_SETLK, libc::F_RDLCK as c_int, byte, 1)
}

pub fn unlock_byte(file: &File, byte: u64) -> Result<()> {
    record_lock(file, F_SETLK, libc::F_UNLCK as c_int, byte, 1)
}

/// Drop every record lock this handle holds on the file.
pub fn unlock(file: &File) -> Result<()> {
    record_lock(file, F_SETLK, libc::F_UNLCK as c_int, 0, 0)
}

/// Device and inode of a file, the identity classic record locks attach to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeKey {
    dev: u64,
    ino: u64,
}

impl InodeKey {
    pub fn of_file(file: &File) -> Result<Self> {
        let meta = file.metadata()?;
        Ok(InodeKey {
            dev: meta.dev(),
            ino: meta.ino(),
        })
    }

    /// `None` when nothing exists at `path` yet
    pub fn of_path(path: &Path) -> Result<Option<Self>> {
        match fs::metadata(path) {
            Ok(meta) => Ok(Some(InodeKey {
                dev: meta.dev(),
                ino: meta.ino(),
            })),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Files this process holds open through [`InodeTable::open`].
///
/// Classic record locks belong to the process and closing any descriptor of
/// a file drops all of them, so a second handle on a file that is already
/// open is refused before a descriptor is ever created for it.
#[derive(Debug, Default)]
pub struct InodeTable {
    open: Mutex<HashSet<InodeKey>>,
}

impl InodeTable {
    pub fn new() -> Self {
        InodeTable::default()
    }

    /// Open `path`, or fail with `Busy` if this table already holds it.
    pub fn open(&'static self, path: &Path, mode: OpenMode) -> Result<(File, InodeClaim)> {
        let mut open = self.open.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(key) = InodeKey::of_path(path)? {
            if open.contains(&key) {
                return Err(Error::Busy);
            }
        }
        let file = open_file(path, mode)?;
        let key = InodeKey::of_file(&file)?;
        if !open.insert(key) {
            // Renamed into place between the two lookups
            return Err(Error::Busy);
        }
        Ok((file, InodeClaim { table: self, key }))
    }

    pub fn contains(&self, key: &InodeKey) -> bool {
        self.open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }
}

/// Entry of an [`InodeTable`]; dropping it lets the file be opened again
#[derive(Debug)]
pub struct InodeClaim {
    table: &'static InodeTable,
    key: InodeKey,
}

impl InodeClaim {
    pub fn key(&self) -> InodeKey {
        self.key
    }
}

impl Drop for InodeClaim {
    fn drop(&mut self) {
        self.table
            .open
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.key);
    }
}

lazy_static! {
    /// Lock files open in this process, tracked where record locks are per process
    pub static ref OPEN_LOCK_FILES: InodeTable = InodeTable::new();
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    fn scratch_file(name: &str) -> (tempfile::TempDir, File) {
        let dir = tempfile::tempdir().unwrap();
        let file = open_file(&dir.path().join(name), OpenMode::Create).unwrap();
        (dir, file)
    }

    #[test]
    fn test_open_missing_file_reports_enoent() {
        let dir = tempfile::tempdir().unwrap();
        let err = open_file(&dir.path().join("missing"), OpenMode::ReadWrite).unwrap_err();
        assert_eq!(err, Error::Os(libc::ENOENT));
    }

    #[test]
    fn test_pwrite_then_pread() {
        let (_dir, file) = scratch_file("io");
        pwrite(&file, b"hello", 10).unwrap();
        assert_eq!(file_size(&file).unwrap(), 15);

        let mut buf = [0u8; 5];
        assert_eq!(pread(&file, &mut buf, 10).unwrap(), 5);
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_pread_stops_at_eof() {
        let (_dir, file) = scratch_file("short");
        pwrite(&file, b"abc", 0).unwrap();
        let mut buf = [0u8; 16];
        assert_eq!(pread(&file, &mut buf, 1).unwrap(), 2);
        assert_eq!(&buf[..2], b"bc");
    }

    #[test]
    fn test_ftruncate_and_sync() {
        let (_dir, file) = scratch_file("trunc");
        ftruncate(&file, 8192).unwrap();
        assert_eq!(file_size(&file).unwrap(), 8192);
        filesync(&file, SyncMode::Data).unwrap();
        filesync(&file, SyncMode::Full).unwrap();
    }

    #[test]
    fn test_mmap_is_shared_with_file() {
        let (_dir, file) = scratch_file("map");
        ftruncate(&file, syspagesize() as u64).unwrap();
        let mut map = mmap(&file, syspagesize()).unwrap();
        map[0..4].copy_from_slice(b"LUMO");
        msync(&map, false).unwrap();

        let mut buf = [0u8; 4];
        pread(&file, &mut buf, 0).unwrap();
        assert_eq!(&buf, b"LUMO");
    }

    #[test]
    fn test_mlock_single_page() {
        let (_dir, file) = scratch_file("pin");
        ftruncate(&file, syspagesize() as u64).unwrap();
        let map = mmap(&file, syspagesize()).unwrap();
        match mlock(&map) {
            Ok(()) => munlock(&map).unwrap(),
            // Unprivileged sandboxes may forbid pinning entirely
            Err(err) => assert!(matches!(err, Error::Os(libc::EPERM | libc::ENOMEM | libc::EAGAIN))),
        }
    }

    #[test]
    fn test_syspagesize_is_power_of_two() {
        assert!(syspagesize().is_power_of_two());
    }

    #[test]
    fn test_aligned_buf() {
        let mut buf = AlignedBuf::new(4096, 100).unwrap();
        assert_eq!(buf.as_slice().as_ptr() as usize % 4096, 0);
        assert_eq!(buf.len(), 100);
        assert!(buf.as_slice().iter().all(|&b| b == 0));
        buf.as_mut_slice()[99] = 7;
        assert_eq!(buf.as_slice()[99], 7);

        assert_eq!(AlignedBuf::new(3, 10).err(), Some(Error::Os(libc::EINVAL)));
    }

    #[test]
    fn test_gate_timeout_and_handoff() {
        let gate = Arc::new(Gate::new());
        gate.acquire(None).unwrap();
        assert_eq!(gate.try_acquire(), Err(Error::Busy));

        let deadline = Instant::now() + Duration::from_millis(20);
        assert_eq!(gate.acquire(Some(deadline)), Err(Error::Timeout));

        let waiter = {
            let gate = gate.clone();
            std::thread::spawn(move || gate.acquire(None))
        };
        std::thread::sleep(Duration::from_millis(10));
        gate.release();
        waiter.join().unwrap().unwrap();
        assert_eq!(gate.try_acquire(), Err(Error::Busy));
    }

    #[test]
    fn test_thread_self_differs_between_threads() {
        let me = thread_self();
        let other = std::thread::spawn(thread_self).join().unwrap();
        assert_eq!(me, thread_self());
        assert_ne!(me, other);
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_record_locks_between_descriptions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lck");
        let first = open_file(&path, OpenMode::Create).unwrap();
        let second = open_file(&path, OpenMode::ReadWrite).unwrap();

        assert!(try_lock_exclusive(&first, 0).unwrap());
        assert!(!try_lock_exclusive(&second, 0).unwrap());
        assert!(!try_lock_shared(&second, 0).unwrap());
        // Other bytes are independent
        assert!(try_lock_shared(&second, 1).unwrap());
        assert!(!try_lock_exclusive(&first, 1).unwrap());
        unlock_byte(&second, 1).unwrap();
        assert!(try_lock_exclusive(&first, 1).unwrap());

        downgrade(&first, 0).unwrap();
        assert!(try_lock_shared(&second, 0).unwrap());
        assert!(!try_lock_exclusive(&second, 0).unwrap());
        assert!(!try_lock_shared(&second, 1).unwrap());

        unlock(&first).unwrap();
        // Upgrading our own shared lock succeeds once nobody else holds one
        assert!(try_lock_exclusive(&second, 0).unwrap());
        assert!(try_lock_shared(&second, 1).unwrap());
    }

    #[test]
    fn test_inode_table_refuses_second_open() {
        let table: &'static InodeTable = Box::leak(Box::new(InodeTable::new()));
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("lck");

        let (_file, claim) = table.open(&path, OpenMode::Create).unwrap();
        assert!(table.contains(&claim.key()));
        assert_eq!(table.open(&path, OpenMode::Create).err(), Some(Error::Busy));

        // A hard link is the same inode
        let link = dir.path().join("alias");
        fs::hard_link(&path, &link).unwrap();
        assert_eq!(table.open(&link, OpenMode::ReadWrite).err(), Some(Error::Busy));

        let key = claim.key();
        drop(claim);
        assert!(!table.contains(&key));
        table.open(&path, OpenMode::ReadWrite).unwrap();
    }
}
