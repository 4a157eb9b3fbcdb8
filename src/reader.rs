//! Shared table of active read transactions.
//!
//! Slot claims and scans run under the reader table mutex; releasing a slot
//! is a lone atomic retire and never waits. The writer computes the oldest
//! snapshot still in use from this table before reusing pages.

use std::collections::HashMap;
use std::fmt;
use std::thread;
use std::time::Duration;

use log::{debug, trace, warn};

use crate::constants::FREE_TXNID;
use crate::error::{Error, Result};
use crate::lck::LockFile;
use crate::osal;

/// One live reader, as seen by `reader_list`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReaderInfo {
    /// Slot index in the reader table
    pub slot: usize,
    /// Process ID
    pub pid: u32,
    /// Thread ID
    pub tid: u64,
    /// Transaction ID being read
    pub txn_id: u64,
}

/// A claimed reader slot. Dropping it releases the slot.
pub struct ReadSlot<'env> {
    lck: &'env LockFile,
    index: usize,
    txnid: u64,
    released: bool,
}

impl fmt::Debug for ReadSlot<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadSlot")
            .field("index", &self.index)
            .field("txnid", &self.txnid)
            .field("released", &self.released)
            .finish()
    }
}

impl ReadSlot<'_> {
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn txnid(&self) -> u64 {
        self.txnid
    }

    /// Move the reader to another snapshot without giving up the slot.
    pub fn renew(&mut self, txnid: u64) -> Result<()> {
        if self.released {
            return Err(Error::BadTxnId);
        }
        if txnid == FREE_TXNID {
            return Err(Error::BadTxnId);
        }
        let _guard = self.lck.lock_readers()?;
        let slot = &self.lck.region()?.slots()[self.index];
        if slot.pid() != self.lck.pid() {
            // Reclaimed behind our back
            self.released = true;
            return Err(Error::BadTxnId);
        }
        slot.set_txnid(txnid);
        self.txnid = txnid;
        Ok(())
    }

    /// Give the slot back. Safe to call more than once.
    pub fn release(&mut self) {
        if self.released {
            return;
        }
        self.released = true;
        if let Ok(region) = self.lck.region() {
            if region.slots()[self.index].retire(self.txnid) {
                trace!("released reader slot {} (txnid {})", self.index, self.txnid);
            }
        }
    }
}

impl Drop for ReadSlot<'_> {
    fn drop(&mut self) {
        self.release();
    }
}

fn try_claim(lck: &LockFile, txnid: u64, tid: u64) -> Result<Option<usize>> {
    let _guard = lck.lock_readers()?;
    let region = lck.region()?;
    for (index, slot) in region.slots().iter().enumerate() {
        if slot.is_free() {
            slot.publish(lck.pid(), tid, txnid);
            return Ok(Some(index));
        }
    }
    Ok(None)
}

/// Claim the first free slot for a reader of snapshot `txnid`.
///
/// A full table is first swept for slots of dead processes, then retried
/// `retries` times with doubling back-off before `TableFull` is returned.
pub(crate) fn acquire_slot(lck: &LockFile, txnid: u64, retries: u32) -> Result<ReadSlot<'_>> {
    if txnid == FREE_TXNID {
        return Err(Error::BadTxnId);
    }
    let tid = osal::thread_self();
    for attempt in 0..=retries {
        let mut claimed = try_claim(lck, txnid, tid)?;
        if claimed.is_none() && reclaim_dead_slots(lck)? > 0 {
            claimed = try_claim(lck, txnid, tid)?;
        }
        if let Some(index) = claimed {
            trace!("claimed reader slot {} for txnid {}", index, txnid);
            return Ok(ReadSlot {
                lck,
                index,
                txnid,
                released: false,
            });
        }
        if attempt < retries {
            thread::sleep(Duration::from_millis(1 << attempt.min(6)));
        }
    }
    debug!("reader table full for txnid {}", txnid);
    Err(Error::TableFull)
}

/// Minimum snapshot among live readers, or `None` when nobody reads.
///
/// Computed under the reader table mutex, so it never exceeds the snapshot
/// of any slot that stayed live for the whole call.
pub(crate) fn oldest_live_transaction(lck: &LockFile) -> Result<Option<u64>> {
    let _guard = lck.lock_readers()?;
    Ok(lck
        .region()?
        .slots()
        .iter()
        .filter_map(|slot| slot.snapshot())
        .map(|(_, _, txnid)| txnid)
        .min())
}

/// Free every slot owned by a process that no longer exists.
pub(crate) fn reclaim_dead_slots(lck: &LockFile) -> Result<usize> {
    let _guard = lck.lock_readers()?;
    let region = lck.region()?;
    let mut verdicts: HashMap<u32, bool> = HashMap::new();
    let mut reclaimed = 0;
    for (index, slot) in region.slots().iter().enumerate() {
        let pid = slot.pid();
        if pid == 0 || pid == lck.pid() {
            continue;
        }
        let alive = *verdicts
            .entry(pid)
            .or_insert_with(|| lck.liveness().is_alive(pid));
        if !alive {
            slot.clear();
            reclaimed += 1;
            warn!("reclaimed reader slot {} of dead process {}", index, pid);
        }
    }
    Ok(reclaimed)
}

pub(crate) fn reader_list(lck: &LockFile) -> Result<Vec<ReaderInfo>> {
    Ok(lck
        .region()?
        .slots()
        .iter()
        .enumerate()
        .filter_map(|(slot, entry)| {
            entry.snapshot().map(|(pid, tid, txn_id)| ReaderInfo {
                slot,
                pid,
                tid,
                txn_id,
            })
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lck::{LockConfig, RegionLayout};
    use crate::registry::tests::FakeLiveness;
    use std::sync::Arc;

    fn seized(dir: &tempfile::TempDir, pid: u32, liveness: Arc<FakeLiveness>) -> LockFile {
        let config = LockConfig {
            layout: RegionLayout {
                max_readers: 4,
                max_processes: 4,
            },
            pid,
            liveness,
            writer_timeout: None,
        };
        let mut lck = LockFile::open(&dir.path().join("lock"), config).unwrap();
        lck.seize(false).unwrap();
        lck.downgrade().unwrap();
        lck
    }

    #[test]
    fn test_first_fit_and_reuse() {
        let dir = tempfile::tempdir().unwrap();
        let lck = seized(&dir, 10, Arc::default());

        let a = acquire_slot(&lck, 5, 0).unwrap();
        let b = acquire_slot(&lck, 6, 0).unwrap();
        assert_eq!((a.index(), b.index()), (0, 1));
        drop(a);
        let c = acquire_slot(&lck, 7, 0).unwrap();
        assert_eq!(c.index(), 0);
        assert_eq!(c.txnid(), 7);
    }

    #[test]
    fn test_free_txnid_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let lck = seized(&dir, 10, Arc::default());
        assert_eq!(acquire_slot(&lck, FREE_TXNID, 0).err(), Some(Error::BadTxnId));
    }

    #[test]
    fn test_release_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let lck = seized(&dir, 10, Arc::default());

        let mut slot = acquire_slot(&lck, 3, 0).unwrap();
        slot.release();
        let other = acquire_slot(&lck, 9, 0).unwrap();
        assert_eq!(other.index(), slot.index());
        // A second release must not free the slot now owned by `other`
        slot.release();
        drop(slot);
        assert_eq!(oldest_live_transaction(&lck).unwrap(), Some(9));
    }

    #[test]
    fn test_oldest_and_renew() {
        let dir = tempfile::tempdir().unwrap();
        let lck = seized(&dir, 10, Arc::default());
        assert_eq!(oldest_live_transaction(&lck).unwrap(), None);

        let mut old = acquire_slot(&lck, 20, 0).unwrap();
        let _new = acquire_slot(&lck, 30, 0).unwrap();
        assert_eq!(oldest_live_transaction(&lck).unwrap(), Some(20));

        old.renew(40).unwrap();
        assert_eq!(oldest_live_transaction(&lck).unwrap(), Some(30));
        assert_eq!(reader_list(&lck).unwrap().len(), 2);
    }

    #[test]
    fn test_full_table_reclaims_dead_readers() {
        let dir = tempfile::tempdir().unwrap();
        let liveness = Arc::new(FakeLiveness::default());
        let lck = seized(&dir, 10, liveness.clone());

        let region = lck.region().unwrap();
        for (i, slot) in region.slots().iter().enumerate() {
            slot.publish(500 + i as u32, 1, 100 + i as u64);
        }
        assert_eq!(acquire_slot(&lck, 1, 0).err(), Some(Error::TableFull));

        liveness.kill(502);
        let slot = acquire_slot(&lck, 1, 0).unwrap();
        assert_eq!(slot.index(), 2);
        assert_eq!(oldest_live_transaction(&lck).unwrap(), Some(1));
    }
}
