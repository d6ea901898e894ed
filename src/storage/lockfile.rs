//! Single-instance lock on the data directory.
//!
//! Two agents sharing one sled database end in a cryptic storage-level
//! lock failure. This guard claims the directory first with a pid file
//! and turns the collision into a readable error instead.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

const PID_FILE: &str = "agent.pid";

#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("data directory is held by a running instance (pid {pid})")]
    Held { pid: u32 },
    #[error("lock file I/O failed: {0}")]
    Io(#[from] std::io::Error),
}

/// Pid-file claim on the data directory. Dropping it releases the
/// claim; a file left behind by a crashed process is reclaimed on the
/// next start.
#[derive(Debug)]
pub struct ProcessLock {
    path: PathBuf,
}

impl ProcessLock {
    /// Claim `data_dir` for this process.
    ///
    /// The claim is an atomic `create_new` of the pid file. When the
    /// file already exists, the recorded owner decides the outcome:
    /// a live process means [`LockError::Held`], a dead one means the
    /// stale file is cleared and the claim retried.
    pub fn claim<P: AsRef<Path>>(data_dir: P) -> Result<Self, LockError> {
        let data_dir = data_dir.as_ref();
        fs::create_dir_all(data_dir)?;
        let path = data_dir.join(PID_FILE);

        // Second round runs after a stale file was cleared.
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    write!(file, "{}", std::process::id())?;
                    file.sync_all()?;
                    debug!(path = %path.display(), "Data directory claimed");
                    return Ok(Self { path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => match read_owner(&path) {
                    Some(pid) if process_alive(pid) => {
                        return Err(LockError::Held { pid });
                    }
                    _ => {
                        info!(
                            path = %path.display(),
                            "Clearing pid file left by a dead instance"
                        );
                        fs::remove_file(&path)?;
                    }
                },
                Err(e) => return Err(e.into()),
            }
        }

        // Lost the creation race both rounds; whoever won is alive.
        let pid = read_owner(&path).unwrap_or(0);
        Err(LockError::Held { pid })
    }
}

impl Drop for ProcessLock {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "Could not remove pid file");
        } else {
            debug!(path = %self.path.display(), "Data directory claim released");
        }
    }
}

/// The pid recorded in an existing lock file, if it parses.
fn read_owner(path: &Path) -> Option<u32> {
    fs::read_to_string(path).ok()?.trim().parse().ok()
}

#[cfg(unix)]
fn process_alive(pid: u32) -> bool {
    pid != 0 && Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(not(unix))]
fn process_alive(pid: u32) -> bool {
    // No cheap liveness probe; err on the side of refusing the claim.
    pid != 0
}

#[cfg(test)]
mod tests {
    use super::*;

    // Larger than any configurable pid_max, so never a live process.
    const DEAD_PID: &str = "4294967295";

    #[test]
    fn test_claim_records_own_pid() {
        let tmp = tempfile::tempdir().unwrap();
        let lock = ProcessLock::claim(tmp.path()).unwrap();

        assert_eq!(read_owner(&lock.path), Some(std::process::id()));
    }

    #[test]
    fn test_second_claim_refused_while_held() {
        let tmp = tempfile::tempdir().unwrap();
        let _lock = ProcessLock::claim(tmp.path()).unwrap();

        match ProcessLock::claim(tmp.path()) {
            Err(LockError::Held { pid }) => assert_eq!(pid, std::process::id()),
            other => panic!("expected Held, got {other:?}"),
        }
    }

    #[test]
    fn test_drop_releases_the_claim() {
        let tmp = tempfile::tempdir().unwrap();
        let pid_path = tmp.path().join(PID_FILE);

        {
            let _lock = ProcessLock::claim(tmp.path()).unwrap();
            assert!(pid_path.exists());
        }
        assert!(!pid_path.exists());

        // And the directory is claimable again
        ProcessLock::claim(tmp.path()).unwrap();
    }

    #[cfg(unix)]
    #[test]
    fn test_dead_owner_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(PID_FILE), DEAD_PID).unwrap();

        let lock = ProcessLock::claim(tmp.path()).unwrap();
        assert_eq!(read_owner(&lock.path), Some(std::process::id()));
    }

    #[cfg(unix)]
    #[test]
    fn test_garbage_pid_file_is_reclaimed() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join(PID_FILE), "not-a-pid\n").unwrap();

        assert!(ProcessLock::claim(tmp.path()).is_ok());
    }
}
