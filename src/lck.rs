//! Lock file region and the coordinator that seizes, initializes and
//! guards it.
//!
//! The lock file is mapped shared by every handle that opens the
//! environment. Its layout, in cache-line sized groups:
//!
//! ```text
//! Offset 0:    header          magic, version, signature, capacities,
//!                              generation, last committed txnid
//! Offset 64:   writer mutex    owner word [pid:32][instance:32]
//! Offset 128:  readers mutex   owner word [pid:32][instance:32]
//! Offset 192:  registry        one u32 pid per entry, padded to 64
//! ...          reader slots    one cache line per slot {txnid, tid, pid}
//! ```
//!
//! Ownership of the file itself is arbitrated with record locks on its first
//! byte: the first handle to take the exclusive lock initializes the region
//! and then downgrades to shared; everybody else takes the shared lock and
//! joins the already initialized region. A handle opened for exclusive use
//! also locks the second byte and never downgrades, so joiners can tell it
//! from an initializer and fail instead of waiting.

use std::fs::File;
use std::hint;
use std::mem::{offset_of, size_of};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use log::{debug, info, trace, warn};
use memmap2::MmapMut;

use crate::constants::{
    CACHELINE_SIZE, FREE_TXNID, LCK_MAGIC, LCK_SIGNATURE, LCK_VERSION, MAX_PROCESSES_LIMIT,
    MAX_READERS_LIMIT, SEIZE_ATTEMPTS,
};
use crate::error::{Error, Result};
use crate::osal::{self, AlignedBuf, Gate, InodeClaim, OpenMode};
use crate::registry::ProcessLiveness;

/// Record-locked byte arbitrating initialization and membership
const BODY_BYTE: u64 = 0;
/// Record-locked byte held by handles that never downgrade
const EXCLUSIVE_BYTE: u64 = 1;

/// Handle instance numbers, unique within this process
static INSTANCE_COUNTER: AtomicU32 = AtomicU32::new(1);

/// Pack a pid and handle instance into a mutex owner word
#[inline]
pub(crate) fn owner_word(pid: u32, instance: u32) -> u64 {
    ((pid as u64) << 32) | instance as u64
}

#[inline]
fn owner_pid(word: u64) -> u32 {
    (word >> 32) as u32
}

/// Region header, published by storing `magic` last
#[repr(C, align(64))]
pub(crate) struct Header {
    magic: AtomicU64,
    version: AtomicU64,
    signature: AtomicU32,
    max_readers: AtomicU32,
    max_processes: AtomicU32,
    _reserved: AtomicU32,
    generation: AtomicU64,
    last_txnid: AtomicU64,
}

impl Header {
    pub(crate) fn generation(&self) -> u64 {
        self.generation.load(Ordering::Acquire)
    }

    pub(crate) fn last_txnid(&self) -> u64 {
        self.last_txnid.load(Ordering::Acquire)
    }

    pub(crate) fn set_last_txnid(&self, txnid: u64) {
        self.last_txnid.store(txnid, Ordering::Release)
    }

    fn is_valid(&self) -> bool {
        self.magic.load(Ordering::Acquire) == LCK_MAGIC
            && self.version.load(Ordering::Relaxed) == LCK_VERSION
            && self.signature.load(Ordering::Relaxed) == LCK_SIGNATURE
    }
}

/// One reader slot. Free while `pid == 0`; live once `txnid` is published.
#[repr(C, align(64))]
pub(crate) struct ReaderSlot {
    txnid: AtomicU64,
    tid: AtomicU64,
    pid: AtomicU32,
}

impl ReaderSlot {
    pub(crate) fn is_free(&self) -> bool {
        self.pid.load(Ordering::Acquire) == 0
    }

    pub(crate) fn pid(&self) -> u32 {
        self.pid.load(Ordering::Acquire)
    }

    /// Claim the slot. The txnid goes last so scanners never see a live
    /// slot whose snapshot is not yet valid.
    pub(crate) fn publish(&self, pid: u32, tid: u64, txnid: u64) {
        self.pid.store(pid, Ordering::Release);
        self.tid.store(tid, Ordering::Release);
        self.txnid.store(txnid, Ordering::Release);
    }

    pub(crate) fn set_txnid(&self, txnid: u64) {
        self.txnid.store(txnid, Ordering::Release);
    }

    /// Free the slot if it still carries `txnid`; false if someone beat us.
    pub(crate) fn retire(&self, txnid: u64) -> bool {
        if self
            .txnid
            .compare_exchange(txnid, FREE_TXNID, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }
        self.tid.store(0, Ordering::Relaxed);
        self.pid.store(0, Ordering::Release);
        true
    }

    pub(crate) fn clear(&self) {
        self.txnid.store(FREE_TXNID, Ordering::Release);
        self.tid.store(0, Ordering::Relaxed);
        self.pid.store(0, Ordering::Release);
    }

    /// `(pid, tid, txnid)` of a live slot
    pub(crate) fn snapshot(&self) -> Option<(u32, u64, u64)> {
        let txnid = self.txnid.load(Ordering::Acquire);
        let pid = self.pid.load(Ordering::Acquire);
        if pid == 0 || txnid == FREE_TXNID {
            return None;
        }
        Some((pid, self.tid.load(Ordering::Acquire), txnid))
    }
}

/// Spin, then yield, then sleep with doubling intervals.
struct Backoff {
    step: u32,
}

impl Backoff {
    const SPIN_LIMIT: u32 = 6;
    const YIELD_LIMIT: u32 = 10;
    const SLEEP_LIMIT: u32 = 15;

    fn new() -> Self {
        Backoff { step: 0 }
    }

    fn snooze(&mut self) {
        if self.step <= Self::SPIN_LIMIT {
            for _ in 0..(1u32 << self.step) {
                hint::spin_loop();
            }
        } else if self.step <= Self::YIELD_LIMIT {
            thread::yield_now();
        } else {
            thread::sleep(Duration::from_micros(50 << (self.step - Self::YIELD_LIMIT)));
        }
        if self.step < Self::SLEEP_LIMIT {
            self.step += 1;
        }
    }

    /// Waited long enough that the owner may have died
    fn is_sleeping(&self) -> bool {
        self.step > Self::YIELD_LIMIT
    }
}

/// Inter-process mutex living in the shared region.
///
/// The owner word names the holding process, so a waiter can tell an
/// abandoned lock from a busy one. Acquiring an abandoned lock reports
/// `Error::StaleLockReclaimed` while leaving the caller as the new owner.
#[repr(C, align(64))]
pub(crate) struct SharedMutex {
    owner: AtomicU64,
}

impl SharedMutex {
    fn attempt(&self, me: u64, probe: Option<&dyn ProcessLiveness>) -> Result<()> {
        let current = self.owner.load(Ordering::Acquire);
        if current == 0 {
            return self
                .owner
                .compare_exchange(0, me, Ordering::AcqRel, Ordering::Acquire)
                .map(|_| ())
                .map_err(|_| Error::Busy);
        }
        if current == me {
            return Err(Error::Busy);
        }
        let pid = owner_pid(current);
        match probe {
            Some(liveness) if !liveness.is_alive(pid) => self
                .owner
                .compare_exchange(current, me, Ordering::AcqRel, Ordering::Acquire)
                .map_err(|_| Error::Busy)
                .and(Err(Error::StaleLockReclaimed { pid })),
            _ => Err(Error::Busy),
        }
    }

    pub(crate) fn try_lock(&self, me: u64, liveness: &dyn ProcessLiveness) -> Result<()> {
        self.attempt(me, Some(liveness))
    }

    /// Block until acquired or `deadline` passes.
    pub(crate) fn lock(
        &self,
        me: u64,
        liveness: &dyn ProcessLiveness,
        deadline: Option<Instant>,
    ) -> Result<()> {
        let mut backoff = Backoff::new();
        loop {
            let probe = if backoff.is_sleeping() { Some(liveness) } else { None };
            match self.attempt(me, probe) {
                Err(Error::Busy) => {}
                other => return other,
            }
            if matches!(deadline, Some(deadline) if Instant::now() >= deadline) {
                return Err(Error::Timeout);
            }
            backoff.snooze();
        }
    }

    /// Release if `me` owns it.
    pub(crate) fn unlock(&self, me: u64) -> bool {
        self.owner
            .compare_exchange(me, 0, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    pub(crate) fn holder_pid(&self) -> Option<u32> {
        match self.owner.load(Ordering::Acquire) {
            0 => None,
            word => Some(owner_pid(word)),
        }
    }
}

const _: () = assert!(size_of::<Header>() == CACHELINE_SIZE);
const _: () = assert!(size_of::<SharedMutex>() == CACHELINE_SIZE);
const _: () = assert!(size_of::<ReaderSlot>() == CACHELINE_SIZE);

/// Capacities that fix the byte layout of a lock file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RegionLayout {
    pub(crate) max_readers: u32,
    pub(crate) max_processes: u32,
}

impl RegionLayout {
    const WRITER_OFFSET: usize = size_of::<Header>();
    const READERS_MUTEX_OFFSET: usize = Self::WRITER_OFFSET + size_of::<SharedMutex>();
    const REGISTRY_OFFSET: usize = Self::READERS_MUTEX_OFFSET + size_of::<SharedMutex>();

    fn slots_offset(&self) -> usize {
        let registry = self.max_processes as usize * size_of::<AtomicU32>();
        (Self::REGISTRY_OFFSET + registry + CACHELINE_SIZE - 1) & !(CACHELINE_SIZE - 1)
    }

    pub(crate) fn len(&self) -> usize {
        self.slots_offset() + self.max_readers as usize * size_of::<ReaderSlot>()
    }

    fn is_sane(&self) -> bool {
        (1..=MAX_READERS_LIMIT).contains(&self.max_readers)
            && (1..=MAX_PROCESSES_LIMIT).contains(&self.max_processes)
    }
}

/// What an on-disk header says before anything is mapped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HeaderState {
    /// Empty file, or an initializer died before publishing the magic
    Blank,
    Valid { layout: RegionLayout, generation: u64 },
}

fn read_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_ne_bytes(bytes)
}

fn read_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_ne_bytes(bytes)
}

/// Validate the header with positioned reads only, so a mismatching file is
/// never mapped or written.
fn inspect_header(file: &File) -> Result<HeaderState> {
    let file_len = osal::file_size(file)?;
    if file_len == 0 {
        return Ok(HeaderState::Blank);
    }

    let mut buf = AlignedBuf::new(CACHELINE_SIZE, size_of::<Header>())?;
    let read = osal::pread(file, buf.as_mut_slice(), 0)?;
    let buf = buf.as_slice();
    if read < buf.len() {
        return Err(Error::CorruptLockFile);
    }

    let magic = read_u64(buf, offset_of!(Header, magic));
    if magic == 0 {
        return Ok(HeaderState::Blank);
    }
    if magic != LCK_MAGIC
        || read_u64(buf, offset_of!(Header, version)) != LCK_VERSION
        || read_u32(buf, offset_of!(Header, signature)) != LCK_SIGNATURE
    {
        return Err(Error::CorruptLockFile);
    }

    let layout = RegionLayout {
        max_readers: read_u32(buf, offset_of!(Header, max_readers)),
        max_processes: read_u32(buf, offset_of!(Header, max_processes)),
    };
    if !layout.is_sane() || layout.len() as u64 != file_len {
        return Err(Error::CorruptLockFile);
    }
    Ok(HeaderState::Valid {
        layout,
        generation: read_u64(buf, offset_of!(Header, generation)),
    })
}

/// The mapped lock file
pub(crate) struct LockRegion {
    map: MmapMut,
    layout: RegionLayout,
}

impl LockRegion {
    fn map(file: &File, layout: RegionLayout) -> Result<Self> {
        let map = osal::mmap(file, layout.len())?;
        Ok(LockRegion { map, layout })
    }

    // SAFETY for the accessors below: the map is page aligned and exactly
    // `layout.len()` bytes, every field is an atomic, and the references
    // cannot outlive `self.map`.

    pub(crate) fn header(&self) -> &Header {
        unsafe { &*(self.map.as_ptr() as *const Header) }
    }

    pub(crate) fn writer_mutex(&self) -> &SharedMutex {
        unsafe { &*(self.map.as_ptr().add(RegionLayout::WRITER_OFFSET) as *const SharedMutex) }
    }

    pub(crate) fn readers_mutex(&self) -> &SharedMutex {
        unsafe {
            &*(self.map.as_ptr().add(RegionLayout::READERS_MUTEX_OFFSET) as *const SharedMutex)
        }
    }

    pub(crate) fn registry(&self) -> &[AtomicU32] {
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(RegionLayout::REGISTRY_OFFSET) as *const AtomicU32,
                self.layout.max_processes as usize,
            )
        }
    }

    pub(crate) fn slots(&self) -> &[ReaderSlot] {
        unsafe {
            std::slice::from_raw_parts(
                self.map.as_ptr().add(self.layout.slots_offset()) as *const ReaderSlot,
                self.layout.max_readers as usize,
            )
        }
    }

    pub(crate) fn layout(&self) -> RegionLayout {
        self.layout
    }

    /// Check the header is still the one this build understands.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.header().is_valid() {
            Ok(())
        } else {
            Err(Error::CorruptLockFile)
        }
    }

    /// Write a fresh header over a zero-filled region, magic last.
    fn format(&self, generation: u64) {
        let header = self.header();
        header.version.store(LCK_VERSION, Ordering::Relaxed);
        header.signature.store(LCK_SIGNATURE, Ordering::Relaxed);
        header.max_readers.store(self.layout.max_readers, Ordering::Relaxed);
        header
            .max_processes
            .store(self.layout.max_processes, Ordering::Relaxed);
        header.generation.store(generation, Ordering::Relaxed);
        header.last_txnid.store(0, Ordering::Relaxed);
        for slot in self.slots() {
            slot.clear();
        }
        header.magic.store(LCK_MAGIC, Ordering::Release);
    }

    /// Log whatever a previous generation left behind. Holders of this
    /// region are gone by definition once the exclusive lock is ours.
    fn report_stale(&self, liveness: &dyn ProcessLiveness) -> usize {
        let mut stale = 0;
        for entry in self.registry() {
            let pid = entry.load(Ordering::Acquire);
            if pid == 0 {
                continue;
            }
            if liveness.is_alive(pid) {
                debug!("process {} is registered but no longer holds the lock file", pid);
            } else {
                warn!("reclaiming lock file registration of dead process {}", pid);
                stale += 1;
            }
        }
        if let Some(pid) = self.writer_mutex().holder_pid() {
            warn!("reclaiming writer lock abandoned by process {}", pid);
            stale += 1;
        }
        if let Some(pid) = self.readers_mutex().holder_pid() {
            warn!("reclaiming reader table lock abandoned by process {}", pid);
            stale += 1;
        }
        let readers = self.slots().iter().filter(|s| s.snapshot().is_some()).count();
        if readers > 0 {
            warn!("dropping {} reader slots left by a previous generation", readers);
        }
        stale
    }
}

/// Lock coordinator states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockState {
    /// File opened, no record lock held
    Unseized,
    /// Sole holder, initializing the region
    ExclusiveInit,
    /// Sole holder for the lifetime of the handle
    Exclusive,
    /// Participant alongside other handles
    Shared,
}

pub(crate) struct LockConfig {
    pub(crate) layout: RegionLayout,
    pub(crate) pid: u32,
    pub(crate) liveness: Arc<dyn ProcessLiveness>,
    pub(crate) writer_timeout: Option<Duration>,
}

/// One handle's view of the lock file
pub(crate) struct LockFile {
    path: PathBuf,
    file: File,
    config: LockConfig,
    me: u64,
    state: LockState,
    region: Option<LockRegion>,
    initialized: bool,
    pinned: bool,
    readers_local: Mutex<()>,
    writer_gate: Gate,
    /// Held after `file` is closed, where record locks are per process
    _claim: Option<InodeClaim>,
}

impl LockFile {
    pub(crate) fn open(path: &Path, config: LockConfig) -> Result<Self> {
        let (file, claim) = if osal::RECORD_LOCKS_PER_HANDLE {
            (osal::open_file(path, OpenMode::Create)?, None)
        } else {
            let (file, claim) = osal::OPEN_LOCK_FILES.open(path, OpenMode::Create)?;
            (file, Some(claim))
        };
        let instance = INSTANCE_COUNTER.fetch_add(1, Ordering::Relaxed);
        Ok(LockFile {
            path: path.to_path_buf(),
            file,
            me: owner_word(config.pid, instance),
            config,
            state: LockState::Unseized,
            region: None,
            initialized: false,
            pinned: false,
            readers_local: Mutex::new(()),
            writer_gate: Gate::new(),
            _claim: claim,
        })
    }

    /// Become the initializer of the lock file or join its current holders.
    ///
    /// With `exclusive_only` the call fails with `Busy` instead of joining.
    /// Joining never blocks: while another handle holds the file
    /// exclusively for good the call fails with `Busy`, and an initializer
    /// that has not downgraded yet is waited for with bounded back-off.
    pub(crate) fn seize(&mut self, exclusive_only: bool) -> Result<LockState> {
        if self.state != LockState::Unseized {
            return Err(Error::EnvAlreadyOpen);
        }

        for attempt in 0..SEIZE_ATTEMPTS {
            if exclusive_only && !osal::try_lock_exclusive(&self.file, EXCLUSIVE_BYTE)? {
                return Err(Error::Busy);
            }
            if osal::try_lock_exclusive(&self.file, BODY_BYTE)? {
                if let Err(err) = self.init_region() {
                    self.release_record_lock();
                    return Err(err);
                }
                self.initialized = true;
                self.state = if exclusive_only {
                    LockState::Exclusive
                } else {
                    LockState::ExclusiveInit
                };
                info!(
                    "seized lock file {} exclusively (pid {})",
                    self.path.display(),
                    self.config.pid
                );
                return Ok(self.state);
            }
            if exclusive_only {
                self.release_record_lock();
                return Err(Error::Busy);
            }

            // Exclusive holders lock the marker byte before the body, so a
            // free marker means the body holder is an initializer.
            if !osal::try_lock_shared(&self.file, EXCLUSIVE_BYTE)? {
                debug!("lock file {} is held exclusively", self.path.display());
                return Err(Error::Busy);
            }
            osal::unlock_byte(&self.file, EXCLUSIVE_BYTE)?;

            if osal::try_lock_shared(&self.file, BODY_BYTE)? {
                match self.join_region() {
                    Ok(true) => {
                        self.state = LockState::Shared;
                        debug!(
                            "joined lock file {} (pid {})",
                            self.path.display(),
                            self.config.pid
                        );
                        return Ok(self.state);
                    }
                    Ok(false) => {
                        debug!("lock file not initialized yet, retrying seize (attempt {})", attempt);
                        osal::unlock(&self.file)?;
                    }
                    Err(err) => {
                        self.release_record_lock();
                        return Err(err);
                    }
                }
            } else {
                trace!("lock file still being initialized (attempt {})", attempt);
            }
            thread::sleep(Duration::from_millis(1 << attempt.min(4)));
        }
        warn!("gave up seizing {} after {} attempts", self.path.display(), SEIZE_ATTEMPTS);
        Err(Error::Busy)
    }

    fn init_region(&mut self) -> Result<()> {
        let mut generation = 0;
        if let HeaderState::Valid {
            layout,
            generation: previous,
        } = inspect_header(&self.file)?
        {
            generation = previous;
            let stale = LockRegion::map(&self.file, layout)?;
            let reclaimed = stale.report_stale(&*self.config.liveness);
            if reclaimed > 0 {
                info!("reclaimed {} stale locks in {}", reclaimed, self.path.display());
            }
        }

        let layout = self.config.layout;
        osal::ftruncate(&self.file, 0)?;
        osal::ftruncate(&self.file, layout.len() as u64)?;
        let region = LockRegion::map(&self.file, layout)?;
        region.format(generation.wrapping_add(1));
        trace!(
            "formatted lock region: {} readers, {} processes, generation {}",
            layout.max_readers,
            layout.max_processes,
            generation.wrapping_add(1)
        );
        self.region = Some(region);
        Ok(())
    }

    /// Map an initialized region; `Ok(false)` when there is nothing to join yet.
    fn join_region(&mut self) -> Result<bool> {
        match inspect_header(&self.file)? {
            HeaderState::Blank => Ok(false),
            HeaderState::Valid { layout, .. } => {
                if layout != self.config.layout {
                    debug!(
                        "adopting lock file capacities: {} readers, {} processes",
                        layout.max_readers, layout.max_processes
                    );
                }
                self.region = Some(LockRegion::map(&self.file, layout)?);
                Ok(true)
            }
        }
    }

    /// Finish initialization and become an ordinary participant.
    pub(crate) fn downgrade(&mut self) -> Result<LockState> {
        match self.state {
            LockState::Unseized => Err(Error::EnvNotInitialized),
            LockState::Shared => Ok(LockState::Shared),
            LockState::ExclusiveInit | LockState::Exclusive => {
                osal::downgrade(&self.file, BODY_BYTE)?;
                osal::unlock_byte(&self.file, EXCLUSIVE_BYTE)?;
                self.state = LockState::Shared;
                debug!("downgraded lock file {} to shared", self.path.display());
                Ok(self.state)
            }
        }
    }

    pub(crate) fn pin(&mut self) -> Result<()> {
        let region = self.region.as_ref().ok_or(Error::EnvNotInitialized)?;
        osal::mlock(&region.map)?;
        self.pinned = true;
        Ok(())
    }

    pub(crate) fn sync(&self, force: bool) -> Result<()> {
        osal::msync(&self.region()?.map, !force)
    }

    fn release_record_lock(&self) {
        if let Err(err) = osal::unlock(&self.file) {
            warn!("failed to release record lock on {}: {}", self.path.display(), err);
        }
    }

    /// Unmap the region and give up the record lock. The region is left
    /// as is for the next handle to join or seize.
    pub(crate) fn destroy(&mut self) {
        if self.state == LockState::Unseized {
            return;
        }
        if let Some(region) = self.region.take() {
            if self.pinned {
                if let Err(err) = osal::munlock(&region.map) {
                    warn!("failed to unpin lock region: {}", err);
                }
                self.pinned = false;
            }
        }
        self.release_record_lock();
        self.state = LockState::Unseized;
        debug!("released lock file {}", self.path.display());
    }

    pub(crate) fn region(&self) -> Result<&LockRegion> {
        self.region.as_ref().ok_or(Error::EnvNotInitialized)
    }

    pub(crate) fn state(&self) -> LockState {
        self.state
    }

    pub(crate) fn initialized_region(&self) -> bool {
        self.initialized
    }

    pub(crate) fn pid(&self) -> u32 {
        self.config.pid
    }

    pub(crate) fn liveness(&self) -> &dyn ProcessLiveness {
        &*self.config.liveness
    }

    pub(crate) fn path(&self) -> &Path {
        &self.path
    }

    /// Take the reader table mutex, shared with every thread and process.
    pub(crate) fn lock_readers(&self) -> Result<ReadersLock<'_>> {
        let region = self.region()?;
        let local = self
            .readers_local
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match region
            .readers_mutex()
            .lock(self.me, self.liveness(), None)
        {
            Ok(()) => {}
            Err(Error::StaleLockReclaimed { pid }) => {
                warn!("recovered reader table lock abandoned by process {}", pid);
            }
            Err(err) => return Err(err),
        }
        Ok(ReadersLock {
            mutex: region.readers_mutex(),
            me: self.me,
            _local: local,
        })
    }

    /// Take the single-writer mutex, waiting up to the configured timeout.
    pub(crate) fn lock_writer(&self) -> Result<WriterLock<'_>> {
        let region = self.region()?;
        let deadline = self.config.writer_timeout.map(|t| Instant::now() + t);
        self.writer_gate.acquire(deadline)?;
        let result = region
            .writer_mutex()
            .lock(self.me, self.liveness(), deadline);
        self.finish_writer(region, result)
    }

    /// Take the single-writer mutex only if it is free right now.
    pub(crate) fn try_lock_writer(&self) -> Result<WriterLock<'_>> {
        let region = self.region()?;
        self.writer_gate.try_acquire()?;
        let result = region.writer_mutex().try_lock(self.me, self.liveness());
        self.finish_writer(region, result)
    }

    fn finish_writer<'a>(
        &'a self,
        region: &'a LockRegion,
        result: Result<()>,
    ) -> Result<WriterLock<'a>> {
        let recovered_from = match result {
            Ok(()) => None,
            Err(Error::StaleLockReclaimed { pid }) => {
                warn!("recovered writer lock abandoned by process {}", pid);
                Some(pid)
            }
            Err(err) => {
                self.writer_gate.release();
                return Err(err);
            }
        };
        trace!("writer lock taken by pid {}", self.config.pid);
        Ok(WriterLock {
            lck: self,
            region,
            recovered_from,
        })
    }
}

impl Drop for LockFile {
    fn drop(&mut self) {
        self.destroy();
    }
}

/// Held reader table mutex; released on drop
pub struct ReadersLock<'a> {
    mutex: &'a SharedMutex,
    me: u64,
    _local: MutexGuard<'a, ()>,
}

impl Drop for ReadersLock<'_> {
    fn drop(&mut self) {
        self.mutex.unlock(self.me);
    }
}

/// Held single-writer lock; released on drop or [`WriterLock::unlock`]
pub struct WriterLock<'a> {
    lck: &'a LockFile,
    region: &'a LockRegion,
    recovered_from: Option<u32>,
}

impl WriterLock<'_> {
    /// Pid of the dead process this lock was recovered from, if any
    pub fn recovered_from(&self) -> Option<u32> {
        self.recovered_from
    }

    /// Publish `txnid` as the last committed transaction. Ids only grow.
    pub fn commit(&self, txnid: u64) -> Result<()> {
        let header = self.region.header();
        if txnid == FREE_TXNID || txnid <= header.last_txnid() {
            return Err(Error::BadTxnId);
        }
        header.set_last_txnid(txnid);
        trace!("committed txnid {}", txnid);
        Ok(())
    }

    pub fn unlock(self) {}
}

impl Drop for WriterLock<'_> {
    fn drop(&mut self) {
        if !self.region.writer_mutex().unlock(self.lck.me) {
            warn!("writer lock of pid {} was taken over while held", self.lck.pid());
        }
        self.lck.writer_gate.release();
        trace!("writer lock released by pid {}", self.lck.pid());
    }
}
