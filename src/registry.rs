//! Process registry kept in the lock file, and the liveness probe used to
//! tell crashed participants from slow ones.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use lazy_static::lazy_static;
use log::{debug, warn};

use crate::error::{Error, Result};
use crate::lck::{LockFile, LockRegion};
use crate::osal;

/// Answers whether a process recorded in the lock file still exists.
pub trait ProcessLiveness: Send + Sync {
    fn is_alive(&self, pid: u32) -> bool;
}

/// Probes with a null signal: `ESRCH` means gone, `EPERM` means alive but
/// owned by someone else.
#[derive(Debug, Clone, Copy, Default)]
pub struct OsLiveness;

impl ProcessLiveness for OsLiveness {
    fn is_alive(&self, pid: u32) -> bool {
        if pid == 0 || pid > i32::MAX as u32 {
            return false;
        }
        if pid == osal::getpid() {
            return true;
        }
        if unsafe { libc::kill(pid as libc::pid_t, 0) } == 0 {
            return true;
        }
        Error::last_os_error() == Error::Os(libc::EPERM)
    }
}

lazy_static! {
    pub(crate) static ref OS_LIVENESS: Arc<dyn ProcessLiveness> = Arc::new(OsLiveness);
}

fn claim_entry(entries: &[AtomicU32], pid: u32) -> Option<usize> {
    entries.iter().position(|entry| {
        entry
            .compare_exchange(0, pid, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    })
}

fn reclaim_dead_locked(lck: &LockFile, region: &LockRegion) -> usize {
    let mut reclaimed = 0;
    for entry in region.registry() {
        let pid = entry.load(Ordering::Acquire);
        if pid == 0 || pid == lck.pid() || lck.liveness().is_alive(pid) {
            continue;
        }
        if entry
            .compare_exchange(pid, 0, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            warn!("cleared registration of dead process {}", pid);
            reclaimed += 1;
        }
    }
    reclaimed
}

/// Record this handle's pid, returning the registry entry it occupies.
pub(crate) fn register_self(lck: &LockFile) -> Result<usize> {
    let _guard = lck.lock_readers()?;
    let region = lck.region()?;
    region.validate()?;

    let pid = lck.pid();
    if let Some(index) = claim_entry(region.registry(), pid) {
        debug!("registered pid {} in entry {}", pid, index);
        return Ok(index);
    }
    if reclaim_dead_locked(lck, region) > 0 {
        if let Some(index) = claim_entry(region.registry(), pid) {
            debug!("registered pid {} in reclaimed entry {}", pid, index);
            return Ok(index);
        }
    }
    warn!(
        "process registry of {} is full ({} entries)",
        lck.path().display(),
        region.registry().len()
    );
    Err(Error::RegistryFull)
}

/// Drop this handle's registration. Clearing twice is harmless.
pub(crate) fn clear_self(lck: &LockFile, index: usize) -> Result<()> {
    let region = lck.region()?;
    let entry = region.registry().get(index).ok_or(Error::EnvInvalidConfig)?;
    if entry
        .compare_exchange(lck.pid(), 0, Ordering::AcqRel, Ordering::Acquire)
        .is_ok()
    {
        debug!("cleared registration of pid {} in entry {}", lck.pid(), index);
    }
    Ok(())
}

pub(crate) fn check_liveness(lck: &LockFile, pid: u32) -> bool {
    lck.liveness().is_alive(pid)
}

pub(crate) fn registered_pids(lck: &LockFile) -> Result<Vec<u32>> {
    let region = lck.region()?;
    Ok(region
        .registry()
        .iter()
        .map(|entry| entry.load(Ordering::Acquire))
        .filter(|&pid| pid != 0)
        .collect())
}

pub(crate) fn reclaim_dead_registrations(lck: &LockFile) -> Result<usize> {
    let _guard = lck.lock_readers()?;
    Ok(reclaim_dead_locked(lck, lck.region()?))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Mutex;

    /// Liveness oracle where every pid lives until `kill`ed
    #[derive(Default)]
    pub(crate) struct FakeLiveness {
        dead: Mutex<HashSet<u32>>,
    }

    impl FakeLiveness {
        pub(crate) fn kill(&self, pid: u32) {
            self.dead.lock().unwrap().insert(pid);
        }
    }

    impl ProcessLiveness for FakeLiveness {
        fn is_alive(&self, pid: u32) -> bool {
            pid != 0 && !self.dead.lock().unwrap().contains(&pid)
        }
    }

    #[test]
    fn test_os_liveness_sees_self() {
        assert!(OsLiveness.is_alive(osal::getpid()));
        assert!(OS_LIVENESS.is_alive(osal::getpid()));
        assert!(!OsLiveness.is_alive(0));
    }

    #[test]
    fn test_os_liveness_sees_reaped_child_as_dead() {
        let mut child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        child.wait().unwrap();
        assert!(!OsLiveness.is_alive(pid));
    }

    #[test]
    fn test_claim_entry_first_fit() {
        let entries: Vec<AtomicU32> = (0..3).map(|_| AtomicU32::new(0)).collect();
        entries[0].store(11, Ordering::Relaxed);
        assert_eq!(claim_entry(&entries, 22), Some(1));
        assert_eq!(claim_entry(&entries, 33), Some(2));
        assert_eq!(claim_entry(&entries, 44), None);
    }
}
