use lumodb_lck::{EnvFlags, Environment, Error, LockState, LOCK_FILE_NAME};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::{Duration, Instant};
use tempfile::TempDir;

// Common test setup
fn setup_test_env() -> (TempDir, Environment) {
    let temp_dir = TempDir::new().unwrap();
    let env = Environment::new()
        .unwrap()
        .open(temp_dir.path(), EnvFlags::empty())
        .unwrap();
    (temp_dir, env)
}

#[test]
fn test_environment_open_close() {
    let (dir, mut env) = setup_test_env();
    assert!(env.is_open());
    assert!(env.initialized_region());
    assert_eq!(env.lock_state(), LockState::Shared);
    assert_eq!(env.lock_path().unwrap(), dir.path().join(LOCK_FILE_NAME));
    assert_eq!(env.registered_pids().unwrap(), vec![std::process::id()]);

    env.close();
    assert!(!env.is_open());
    assert_eq!(env.lock_state(), LockState::Unseized);
    assert_eq!(env.info().err(), Some(Error::EnvNotInitialized));
    // Closing twice is a no-op
    env.close();
}

#[test]
fn test_nosubdir_lock_path() {
    let dir = TempDir::new().unwrap();
    let data = dir.path().join("data.mdb");
    let env = Environment::new()
        .unwrap()
        .open(&data, EnvFlags::NOSUBDIR)
        .unwrap();
    assert_eq!(env.lock_path().unwrap(), dir.path().join("data.mdb-lock"));
    assert!(dir.path().join("data.mdb-lock").exists());
}

#[test]
fn test_missing_directory_is_rejected() {
    let dir = TempDir::new().unwrap();
    let result = Environment::new()
        .unwrap()
        .open(dir.path().join("nope"), EnvFlags::empty());
    assert_eq!(result.err(), Some(Error::EnvInvalidPath));
}

#[test]
fn test_config_after_open_is_refused() {
    let (_dir, mut env) = setup_test_env();
    assert_eq!(env.set_max_readers(10), Err(Error::EnvAlreadyOpen));
    assert_eq!(env.set_process_id(77), Err(Error::EnvAlreadyOpen));

    let mut fresh = Environment::new().unwrap();
    assert_eq!(fresh.set_max_readers(0), Err(Error::EnvInvalidConfig));
    assert_eq!(fresh.set_max_processes(0), Err(Error::EnvInvalidConfig));
    assert_eq!(fresh.set_process_id(0), Err(Error::EnvInvalidConfig));
    fresh.set_max_readers(10).unwrap();
    assert_eq!(fresh.get_max_readers(), 10);
}

#[test]
fn test_joiner_adopts_lock_file_capacity() {
    let dir = TempDir::new().unwrap();
    let mut first = Environment::new().unwrap();
    first.set_max_readers(5).unwrap();
    let first = first.open(dir.path(), EnvFlags::empty()).unwrap();

    let mut second = Environment::new().unwrap();
    second.set_max_readers(50).unwrap();
    let second = second.open(dir.path(), EnvFlags::empty()).unwrap();

    assert!(!second.initialized_region());
    assert_eq!(second.get_max_readers(), 5);
    assert_eq!(first.info().unwrap(), second.info().unwrap());
}

#[test]
fn test_read_and_write_transactions() {
    let (_dir, env) = setup_test_env();
    assert_eq!(env.last_committed().unwrap(), 0);

    let writer = env.begin_write().unwrap();
    writer.commit(1).unwrap();
    writer.unlock();

    let read = env.begin_read().unwrap();
    assert_eq!(read.txnid(), 1);
    assert_eq!(env.oldest_live_transaction().unwrap(), Some(1));

    let writer = env.begin_write().unwrap();
    writer.commit(2).unwrap();
    drop(writer);

    let newer = env.begin_read().unwrap();
    assert_eq!(newer.txnid(), 2);
    assert_eq!(env.oldest_live_transaction().unwrap(), Some(1));

    env.release_slot(read);
    assert_eq!(env.oldest_live_transaction().unwrap(), Some(2));
    drop(newer);
    assert_eq!(env.oldest_live_transaction().unwrap(), None);

    let info = env.info().unwrap();
    assert_eq!(info.last_txnid, 2);
    assert_eq!(info.num_readers, 0);
}

#[test]
fn test_readonly_refuses_writer() {
    let dir = TempDir::new().unwrap();
    let env = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::RDONLY)
        .unwrap();
    assert!(env.is_readonly());
    assert_eq!(env.begin_write().err(), Some(Error::EnvReadOnly));
    assert_eq!(env.lock_writer().err(), Some(Error::EnvReadOnly));
    assert_eq!(env.try_lock_writer().err(), Some(Error::EnvReadOnly));
    assert_eq!(env.last_committed().unwrap(), 0);
    // Readers still work
    let slot = env.begin_read().unwrap();
    assert_eq!(env.reader_list().unwrap().len(), 1);
    drop(slot);
}

#[test]
fn test_exclusive_open() {
    let dir = TempDir::new().unwrap();
    let exclusive = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::EXCLUSIVE)
        .unwrap();
    assert_eq!(exclusive.lock_state(), LockState::Exclusive);

    let second = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::EXCLUSIVE);
    assert_eq!(second.err(), Some(Error::Busy));
    drop(exclusive);

    let shared = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::empty())
        .unwrap();
    let again = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::EXCLUSIVE);
    assert_eq!(again.err(), Some(Error::Busy));
    drop(shared);
}

#[test]
fn test_open_refused_while_exclusive_holder_lives() {
    let dir = TempDir::new().unwrap();
    let exclusive = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::EXCLUSIVE)
        .unwrap();

    let started = Instant::now();
    let joiner = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::empty());
    assert_eq!(joiner.err(), Some(Error::Busy));
    let readonly = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::RDONLY);
    assert_eq!(readonly.err(), Some(Error::Busy));
    assert!(started.elapsed() < Duration::from_secs(1));

    drop(exclusive);
    let env = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::empty())
        .unwrap();
    assert!(env.initialized_region());
}

#[test]
fn test_readonly_still_needs_writable_lock_file() {
    // Permission bits do not bind root
    if unsafe { libc::geteuid() } == 0 {
        return;
    }
    let dir = TempDir::new().unwrap();
    drop(
        Environment::new()
            .unwrap()
            .open(dir.path(), EnvFlags::empty())
            .unwrap(),
    );
    let lock_path = dir.path().join(LOCK_FILE_NAME);
    fs::set_permissions(&lock_path, fs::Permissions::from_mode(0o444)).unwrap();

    let result = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::RDONLY);
    assert_eq!(result.err(), Some(Error::Os(libc::EACCES)));
}

#[test]
fn test_reopen_reinitializes_region() {
    let dir = TempDir::new().unwrap();
    {
        let env = Environment::new()
            .unwrap()
            .open(dir.path(), EnvFlags::empty())
            .unwrap();
        env.begin_write().unwrap().commit(9).unwrap();
        env.sync(true).unwrap();
    }
    // Last handle gone: the next opener re-initializes the region
    let env = Environment::new()
        .unwrap()
        .open(dir.path(), EnvFlags::empty())
        .unwrap();
    let info = env.info().unwrap();
    assert_eq!(info.generation, 2);
    assert_eq!(info.last_txnid, 0);
    assert!(fs::metadata(env.lock_path().unwrap()).unwrap().len() > 0);
}

#[test]
fn test_version() {
    assert_eq!(Environment::version_string(), "0.1.0");
    assert_eq!(Environment::version(), (0, 1, 0));
}
