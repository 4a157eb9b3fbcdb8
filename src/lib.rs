// src/lib.rs
//! Cross-process lock table for an LMDB-style storage engine: the shared
//! reader table, the single-writer lock, the process registry and the
//! platform layer they sit on.
mod constants;
mod env;
mod error;
mod lck;
pub mod osal;
mod reader;
mod registry;

pub use constants::{
    EnvFlags, DEFAULT_MAX_PROCESSES, DEFAULT_MAX_READERS, FREE_TXNID, LCK_SIGNATURE,
    LOCK_FILE_NAME, LOCK_SUFFIX, MAX_PROCESSES_LIMIT, MAX_READERS_LIMIT,
};
pub use env::{EnvInfo, Environment};
pub use error::{Error, Result};
pub use lck::{LockState, ReadersLock, WriterLock};
pub use reader::{ReadSlot, ReaderInfo};
pub use registry::{OsLiveness, ProcessLiveness};
