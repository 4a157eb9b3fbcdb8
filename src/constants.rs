use bitflags::bitflags;

// Environment flags
bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct EnvFlags: u32 {
        /// Path names the data file; the lock file sits next to it
        const NOSUBDIR = 0x4000;
        /// Read-only environment, write transactions are refused
        const RDONLY = 0x20000;
        /// Pin the lock region in RAM
        const PINLOCK = 0x40000;
        /// Sole user of the lock file, never downgrades to shared
        const EXCLUSIVE = 0x400000;
    }
}

/// Pack four ASCII bytes into a signature word
pub const fn tetrad(a: u8, b: u8, c: u8, d: u8) -> u32 {
    (a as u32) << 24 | (b as u32) << 16 | (c as u32) << 8 | d as u32
}

/// Magic number for lock files
pub const LCK_MAGIC: u64 = 0x4C55_4D4F_4C43_4B00; // "LUMOLCK\0"
/// Lock file format version
pub const LCK_VERSION: u64 = 1;
/// Signature of the lock primitive this build places in the lock file
pub const LCK_SIGNATURE: u32 = tetrad(b'S', b'C', b'A', b'S');

/// Version numbers major
pub const VERSION_MAJOR: u32 = 0;
/// Version numbers minor
pub const VERSION_MINOR: u32 = 1;
/// Version numbers patch
pub const VERSION_PATCH: u32 = 0;

/// Shared fields are grouped on separate cache lines
pub const CACHELINE_SIZE: usize = 64;

/// Reader slots in a freshly created lock file
pub const DEFAULT_MAX_READERS: u32 = 120;
/// Upper bound accepted by `set_max_readers`
pub const MAX_READERS_LIMIT: u32 = 32767;
/// Process registry entries in a freshly created lock file
pub const DEFAULT_MAX_PROCESSES: u32 = 64;
/// Upper bound accepted by `set_max_processes`
pub const MAX_PROCESSES_LIMIT: u32 = 32767;
/// Attempts made after the reader table is found full
pub const DEFAULT_READER_RETRIES: u32 = 3;
/// Seize attempts while another handle initializes the lock file
pub const SEIZE_ATTEMPTS: u32 = 32;

/// Transaction id stored in a reader slot that has no snapshot
pub const FREE_TXNID: u64 = u64::MAX;

/// Lock file name inside an environment directory
pub const LOCK_FILE_NAME: &str = "lock.mdb";
/// Lock file suffix appended to the data file path with NOSUBDIR
pub const LOCK_SUFFIX: &str = "-lock";
