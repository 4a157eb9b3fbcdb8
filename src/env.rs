use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};

use crate::constants::{
    EnvFlags, DEFAULT_MAX_PROCESSES, DEFAULT_MAX_READERS, DEFAULT_READER_RETRIES, LOCK_FILE_NAME,
    LOCK_SUFFIX, MAX_PROCESSES_LIMIT, MAX_READERS_LIMIT, VERSION_MAJOR, VERSION_MINOR,
    VERSION_PATCH,
};
use crate::error::{Error, Result};
use crate::lck::{LockConfig, LockFile, LockState, ReadersLock, RegionLayout, WriterLock};
use crate::osal;
use crate::reader::{self, ReadSlot, ReaderInfo};
use crate::registry::{self, ProcessLiveness, OS_LIVENESS};

/// Environment information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvInfo {
    pub lock_state: LockState,
    pub max_readers: u32,
    pub max_processes: u32,
    pub num_readers: u32,
    pub last_txnid: u64,
    /// Times the lock file has been initialized
    pub generation: u64,
}

/// One process's handle on the lock table of an environment.
///
/// Configure with the `set_*` methods, then `open`. A handle is `Sync`;
/// threads share it and take reader slots or the writer lock through it.
pub struct Environment {
    /// Path to the environment directory, or data file with NOSUBDIR
    path: PathBuf,
    /// Environment flags
    flags: EnvFlags,
    /// Maximum number of readers
    max_readers: u32,
    /// Maximum number of registered processes
    max_processes: u32,
    /// Attempts on a full reader table
    reader_retries: u32,
    /// Writer lock wait limit
    writer_timeout: Option<Duration>,
    /// Dead-process probe
    liveness: Arc<dyn ProcessLiveness>,
    /// Identity recorded in the lock file
    pid: u32,
    /// Lock file, present once opened
    lck: Option<LockFile>,
    /// Our process registry entry
    registry_index: Option<usize>,
    /// Dead readers swept since the first write
    reader_checked: AtomicBool,
}

impl fmt::Debug for Environment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Environment")
            .field("path", &self.path)
            .field("flags", &self.flags)
            .field("pid", &self.pid)
            .field("max_readers", &self.max_readers)
            .field("lock_state", &self.lock_state())
            .finish()
    }
}

impl Environment {
    /// Create a new environment
    pub fn new() -> Result<Self> {
        Ok(Environment {
            path: PathBuf::new(),
            flags: EnvFlags::empty(),
            max_readers: DEFAULT_MAX_READERS,
            max_processes: DEFAULT_MAX_PROCESSES,
            reader_retries: DEFAULT_READER_RETRIES,
            writer_timeout: None,
            liveness: OS_LIVENESS.clone(),
            pid: osal::getpid(),
            lck: None,
            registry_index: None,
            reader_checked: AtomicBool::new(false),
        })
    }

    fn ensure_closed(&self) -> Result<()> {
        if self.lck.is_some() {
            return Err(Error::EnvAlreadyOpen);
        }
        Ok(())
    }

    fn lck(&self) -> Result<&LockFile> {
        self.lck.as_ref().ok_or(Error::EnvNotInitialized)
    }

    /// Set the maximum number of threads/reader slots
    ///
    /// Only applies when this handle creates the lock file; joiners adopt
    /// the capacity already recorded in it.
    pub fn set_max_readers(&mut self, readers: u32) -> Result<()> {
        self.ensure_closed()?;
        if !(1..=MAX_READERS_LIMIT).contains(&readers) {
            return Err(Error::EnvInvalidConfig);
        }
        self.max_readers = readers;
        Ok(())
    }

    /// Set the number of process registry entries
    pub fn set_max_processes(&mut self, processes: u32) -> Result<()> {
        self.ensure_closed()?;
        if !(1..=MAX_PROCESSES_LIMIT).contains(&processes) {
            return Err(Error::EnvInvalidConfig);
        }
        self.max_processes = processes;
        Ok(())
    }

    /// Bound the wait for the writer lock; `None` waits forever
    pub fn set_writer_timeout(&mut self, timeout: Option<Duration>) -> Result<()> {
        self.ensure_closed()?;
        self.writer_timeout = timeout;
        Ok(())
    }

    /// Set how many back-off rounds a reader waits on a full table
    pub fn set_reader_retries(&mut self, retries: u32) -> Result<()> {
        self.ensure_closed()?;
        if retries > 16 {
            return Err(Error::EnvInvalidConfig);
        }
        self.reader_retries = retries;
        Ok(())
    }

    /// Replace the probe used to detect crashed processes
    pub fn set_liveness(&mut self, liveness: Arc<dyn ProcessLiveness>) -> Result<()> {
        self.ensure_closed()?;
        self.liveness = liveness;
        Ok(())
    }

    /// Override the pid this handle records in the lock file.
    ///
    /// Lets a single OS process act as several participants, each with its
    /// own liveness verdict.
    pub fn set_process_id(&mut self, pid: u32) -> Result<()> {
        self.ensure_closed()?;
        if pid == 0 {
            return Err(Error::EnvInvalidConfig);
        }
        self.pid = pid;
        Ok(())
    }

    /// Open the environment's lock table
    pub fn open<P: AsRef<Path>>(mut self, path: P, flags: EnvFlags) -> Result<Self> {
        self.ensure_closed()?;

        let path = path.as_ref();
        let lock_path = Self::lock_path_for(path, flags)?;
        let config = LockConfig {
            layout: RegionLayout {
                max_readers: self.max_readers,
                max_processes: self.max_processes,
            },
            pid: self.pid,
            liveness: self.liveness.clone(),
            writer_timeout: self.writer_timeout,
        };

        // Reader slots are published in the lock file, so even a read-only
        // environment has to open it for writing
        let mut lck = LockFile::open(&lock_path, config).map_err(|err| {
            if flags.contains(EnvFlags::RDONLY) && matches!(err, Error::Os(libc::EACCES | libc::EROFS))
            {
                warn!(
                    "read-only environment {} needs a writable lock file {}",
                    path.display(),
                    lock_path.display()
                );
            }
            err
        })?;
        let exclusive = flags.contains(EnvFlags::EXCLUSIVE);
        let state = lck.seize(exclusive)?;
        if state == LockState::ExclusiveInit {
            lck.downgrade()?;
        }
        if flags.contains(EnvFlags::PINLOCK) {
            lck.pin()?;
        }
        let index = registry::register_self(&lck)?;

        info!(
            "opened environment {} (pid {}, {:?})",
            path.display(),
            self.pid,
            lck.state()
        );
        self.path = path.to_path_buf();
        self.flags = flags;
        self.lck = Some(lck);
        self.registry_index = Some(index);
        self.reader_checked.store(false, Ordering::Relaxed);
        Ok(self)
    }

    fn lock_path_for(path: &Path, flags: EnvFlags) -> Result<PathBuf> {
        if flags.contains(EnvFlags::NOSUBDIR) {
            let mut name = path
                .file_name()
                .ok_or(Error::EnvInvalidPath)?
                .to_os_string();
            name.push(LOCK_SUFFIX);
            Ok(path.with_file_name(name))
        } else {
            if !path.is_dir() {
                return Err(Error::EnvInvalidPath);
            }
            Ok(path.join(LOCK_FILE_NAME))
        }
    }

    /// Close the environment and release the lock file.
    ///
    /// All reader slots and writer locks borrow the environment, so none
    /// can be outstanding here.
    pub fn close(&mut self) {
        let Some(mut lck) = self.lck.take() else {
            return;
        };
        if let Some(index) = self.registry_index.take() {
            if let Err(err) = registry::clear_self(&lck, index) {
                warn!("failed to clear registration of pid {}: {}", self.pid, err);
            }
        }
        lck.destroy();
        debug!("closed environment {}", self.path.display());
        self.path.clear();
        self.flags = EnvFlags::empty();
    }

    /// Flush the lock region to disk
    pub fn sync(&self, force: bool) -> Result<()> {
        self.lck()?.sync(force)
    }

    /// Begin a read: claim a slot at the last committed snapshot
    pub fn begin_read(&self) -> Result<ReadSlot<'_>> {
        let txnid = self.last_committed()?;
        self.acquire_slot(txnid)
    }

    /// Begin a write: take the writer lock, sweeping dead readers the
    /// first time this handle writes
    pub fn begin_write(&self) -> Result<WriterLock<'_>> {
        let writer = self.lock_writer()?;
        if !self.reader_checked.swap(true, Ordering::AcqRel) {
            let reclaimed = self.reclaim_dead_slots()?;
            if reclaimed > 0 {
                info!("writer startup reclaimed {} dead reader slots", reclaimed);
            }
        }
        Ok(writer)
    }

    /// Claim a reader slot publishing snapshot `txnid`
    pub fn acquire_slot(&self, txnid: u64) -> Result<ReadSlot<'_>> {
        reader::acquire_slot(self.lck()?, txnid, self.reader_retries)
    }

    /// Give a reader slot back; dropping it does the same
    pub fn release_slot(&self, mut slot: ReadSlot<'_>) {
        slot.release();
    }

    /// Minimum snapshot among live readers, `None` when there are none
    pub fn oldest_live_transaction(&self) -> Result<Option<u64>> {
        reader::oldest_live_transaction(self.lck()?)
    }

    /// Free the slots of readers whose process has died
    pub fn reclaim_dead_slots(&self) -> Result<usize> {
        reader::reclaim_dead_slots(self.lck()?)
    }

    /// Check for stale readers, returning how many were cleared
    pub fn reader_check(&self) -> Result<usize> {
        self.reclaim_dead_slots()
    }

    pub fn reader_list(&self) -> Result<Vec<ReaderInfo>> {
        reader::reader_list(self.lck()?)
    }

    /// Hold the reader table mutex
    pub fn lock_readers(&self) -> Result<ReadersLock<'_>> {
        self.lck()?.lock_readers()
    }

    fn writable_lck(&self) -> Result<&LockFile> {
        let lck = self.lck()?;
        if self.flags.contains(EnvFlags::RDONLY) {
            return Err(Error::EnvReadOnly);
        }
        Ok(lck)
    }

    /// Hold the single-writer lock, blocking while another writer runs
    pub fn lock_writer(&self) -> Result<WriterLock<'_>> {
        self.writable_lck()?.lock_writer()
    }

    /// Hold the single-writer lock if nobody else does
    pub fn try_lock_writer(&self) -> Result<WriterLock<'_>> {
        self.writable_lck()?.try_lock_writer()
    }

    pub fn last_committed(&self) -> Result<u64> {
        Ok(self.lck()?.region()?.header().last_txnid())
    }

    /// Whether `pid` is still running, per the configured probe
    pub fn check_liveness(&self, pid: u32) -> bool {
        match &self.lck {
            Some(lck) => registry::check_liveness(lck, pid),
            None => self.liveness.is_alive(pid),
        }
    }

    pub fn registered_pids(&self) -> Result<Vec<u32>> {
        registry::registered_pids(self.lck()?)
    }

    pub fn reclaim_dead_registrations(&self) -> Result<usize> {
        registry::reclaim_dead_registrations(self.lck()?)
    }

    /// Get environment information
    pub fn info(&self) -> Result<EnvInfo> {
        let lck = self.lck()?;
        let region = lck.region()?;
        let layout = region.layout();
        Ok(EnvInfo {
            lock_state: lck.state(),
            max_readers: layout.max_readers,
            max_processes: layout.max_processes,
            num_readers: reader::reader_list(lck)?.len() as u32,
            last_txnid: region.header().last_txnid(),
            generation: region.header().generation(),
        })
    }

    pub fn lock_state(&self) -> LockState {
        self.lck
            .as_ref()
            .map_or(LockState::Unseized, |lck| lck.state())
    }

    /// Whether this handle initialized the lock region when opening
    pub fn initialized_region(&self) -> bool {
        self.lck.as_ref().map_or(false, |lck| lck.initialized_region())
    }

    pub fn is_open(&self) -> bool {
        self.lck.is_some()
    }

    pub fn is_readonly(&self) -> bool {
        self.flags.contains(EnvFlags::RDONLY)
    }

    /// Get the path that was used in open()
    pub fn get_path(&self) -> Result<&Path> {
        self.lck()?;
        Ok(&self.path)
    }

    pub fn lock_path(&self) -> Result<&Path> {
        Ok(self.lck()?.path())
    }

    pub fn get_flags(&self) -> EnvFlags {
        self.flags
    }

    /// Reader capacity in effect: the lock file's once open, else configured
    pub fn get_max_readers(&self) -> u32 {
        self.lck
            .as_ref()
            .and_then(|lck| lck.region().ok())
            .map_or(self.max_readers, |region| region.layout().max_readers)
    }

    pub fn get_max_processes(&self) -> u32 {
        self.lck
            .as_ref()
            .and_then(|lck| lck.region().ok())
            .map_or(self.max_processes, |region| region.layout().max_processes)
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Get library version
    pub fn version() -> (u32, u32, u32) {
        (VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }

    /// Get library version in String format
    pub fn version_string() -> String {
        format!("{}.{}.{}", VERSION_MAJOR, VERSION_MINOR, VERSION_PATCH)
    }
}

impl Drop for Environment {
    fn drop(&mut self) {
        self.close();
    }
}
