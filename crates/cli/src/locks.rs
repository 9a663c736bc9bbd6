//! Pid file keeping one daemon per device

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// Held by a running daemon for its whole life
pub struct DaemonLock {
    path: PathBuf,
    #[allow(dead_code)]
    file: File,
}

/// Lock file content
#[derive(Debug, Serialize, Deserialize)]
pub struct LockContent {
    pub pid: u32,
    /// Milliseconds since the epoch
    pub started_at: i64,
}

impl DaemonLock {
    /// Take the pid file for `device` under `runtime_dir`
    ///
    /// Fails if another live process holds it. A file left behind by a
    /// dead process is replaced.
    pub fn acquire(runtime_dir: &Path, device: &str) -> Result<Self> {
        let lock_path = pid_path(runtime_dir, device);
        std::fs::create_dir_all(runtime_dir).context("Failed to create runtime directory")?;

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("Failed to open pid file {}", lock_path.display()))?;

        if !try_flock_exclusive(&file)? {
            match read_lock_content(&mut file) {
                Ok(content) if is_process_alive(content.pid) => {
                    anyhow::bail!("Cleaner for {device} already running (pid {})", content.pid)
                }
                _ => {
                    tracing::warn!(path = %lock_path.display(), "removing stale pid file");
                    drop(file);
                    std::fs::remove_file(&lock_path)?;
                    return Self::acquire(runtime_dir, device);
                }
            }
        }

        write_lock_content(&mut file)?;

        Ok(Self {
            path: lock_path,
            file,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Release the lock and remove the pid file
    pub fn release(self) -> Result<()> {
        std::fs::remove_file(&self.path).context("Failed to remove pid file")?;
        Ok(())
    }
}

impl Drop for DaemonLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

pub fn pid_path(runtime_dir: &Path, device: &str) -> PathBuf {
    runtime_dir.join(format!("{device}.pid"))
}

/// Pid of the daemon serving `device`, if one is alive
pub fn running_daemon(runtime_dir: &Path, device: &str) -> Option<LockContent> {
    let mut file = File::open(pid_path(runtime_dir, device)).ok()?;
    read_lock_content(&mut file)
        .ok()
        .filter(|content| is_process_alive(content.pid))
}

fn write_lock_content(file: &mut File) -> Result<()> {
    let content = LockContent {
        pid: std::process::id(),
        started_at: chrono::Utc::now().timestamp_millis(),
    };

    let serialized = serde_json::to_string(&content).context("Failed to serialize lock content")?;

    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(serialized.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_content(file: &mut File) -> Result<LockContent> {
    file.seek(SeekFrom::Start(0))?;
    let mut contents = String::new();
    file.read_to_string(&mut contents)?;
    serde_json::from_str(&contents).context("Failed to deserialize lock content")
}

/// Try to acquire exclusive file lock (non-blocking)
fn try_flock_exclusive(file: &File) -> Result<bool> {
    use nix::fcntl::{flock, FlockArg};
    use std::os::unix::io::AsRawFd;

    match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
        Ok(()) => Ok(true),
        Err(nix::errno::Errno::EWOULDBLOCK) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn is_process_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_acquisition() {
        let temp_dir = TempDir::new().unwrap();
        let dir = temp_dir.path();

        let lock1 = DaemonLock::acquire(dir, "sdb1");
        assert!(lock1.is_ok());

        // Held by a live process, this one
        assert!(DaemonLock::acquire(dir, "sdb1").is_err());

        // Another device is independent
        let other = DaemonLock::acquire(dir, "sdc1");
        assert!(other.is_ok());

        drop(lock1);
        assert!(DaemonLock::acquire(dir, "sdb1").is_ok());
    }

    #[test]
    fn test_lock_release() {
        let temp_dir = TempDir::new().unwrap();
        let lock = DaemonLock::acquire(temp_dir.path(), "sdb1").unwrap();
        let lock_path = lock.path().to_path_buf();
        assert_eq!(lock_path, temp_dir.path().join("sdb1.pid"));
        assert!(lock_path.exists());

        lock.release().unwrap();
        assert!(!lock_path.exists());
    }

    #[test]
    fn test_running_daemon() {
        let temp_dir = TempDir::new().unwrap();
        assert!(running_daemon(temp_dir.path(), "sdb1").is_none());

        let _lock = DaemonLock::acquire(temp_dir.path(), "sdb1").unwrap();
        let content = running_daemon(temp_dir.path(), "sdb1").unwrap();
        assert_eq!(content.pid, std::process::id());
        assert!(content.started_at > 0);
    }

    #[test]
    fn test_dead_pid_is_not_running() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(
            pid_path(temp_dir.path(), "sdb1"),
            r#"{"pid":999999,"started_at":1}"#,
        )
        .unwrap();
        assert!(running_daemon(temp_dir.path(), "sdb1").is_none());
        assert!(DaemonLock::acquire(temp_dir.path(), "sdb1").is_ok());
    }

    #[test]
    fn test_process_alive() {
        assert!(is_process_alive(std::process::id()));
        assert!(!is_process_alive(999999));
    }
}
