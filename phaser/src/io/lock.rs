//! Single-controller guard (`.phaser/controller.lock`).
//!
//! The controller holds an exclusive OS lock on the lock file for as long as
//! it runs, and writes its pid there for `status` and `stop`. Liveness is the
//! OS lock alone: the file's contents are informational, and a controller that
//! dies releases the lock with its file descriptors.

use std::fs::{File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::EngineError;

/// Attempts to read a freshly locked file whose owner has not written it yet.
const HOLDER_READ_ATTEMPTS: u32 = 20;
const HOLDER_READ_INTERVAL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockInfo {
    pub pid: u32,
    pub plan_location: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// A controller currently holding the lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockHolder {
    /// What the holder wrote, once it has written it.
    pub info: Option<LockInfo>,
}

impl LockHolder {
    pub fn pid(&self) -> Option<u32> {
        self.info.as_ref().map(|info| info.pid)
    }
}

/// Held for the lifetime of a controller; releases the OS lock on drop.
#[derive(Debug)]
pub struct ControllerLock {
    file: File,
    path: PathBuf,
    info: LockInfo,
}

impl ControllerLock {
    /// Take the lock for `plan_location`.
    ///
    /// Fails with [`EngineError::ControllerAlreadyRunning`] if another
    /// controller holds it.
    pub fn acquire(path: &Path, plan_location: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("create lock dir {}", parent.display()))?;
        }
        let mut file = open_lock_file(path)?;
        let mut attempt = 0;
        loop {
            match FileExt::try_lock_exclusive(&file) {
                Ok(()) => break,
                Err(err) if is_contended(&err) => {
                    // A `status` probe holds the lock for an instant and never writes it.
                    let holder = read_live_info(&mut file);
                    attempt += 1;
                    if holder.is_some() || attempt >= HOLDER_READ_ATTEMPTS {
                        return Err(EngineError::ControllerAlreadyRunning {
                            plan: plan_location.to_path_buf(),
                            pid: holder.map(|info| info.pid),
                        }
                        .into());
                    }
                    thread::sleep(HOLDER_READ_INTERVAL);
                }
                Err(err) => {
                    return Err(err).with_context(|| format!("lock {}", path.display()));
                }
            }
        }

        let info = LockInfo {
            pid: process::id(),
            plan_location: plan_location.to_path_buf(),
            started_at: Utc::now(),
        };
        write_lock_info(&mut file, &info)
            .with_context(|| format!("write lock {}", path.display()))?;
        info!(pid = info.pid, path = %path.display(), "controller lock acquired");
        Ok(Self {
            file,
            path: path.to_path_buf(),
            info,
        })
    }

    pub fn info(&self) -> &LockInfo {
        &self.info
    }
}

impl Drop for ControllerLock {
    fn drop(&mut self) {
        // The file stays: unlinking it would let a waiter lock an orphaned inode.
        if let Err(err) = self.file.set_len(0) {
            warn!(err = %err, path = %self.path.display(), "failed to clear controller lock");
        }
        if let Err(err) = FileExt::unlock(&self.file) {
            warn!(err = %err, path = %self.path.display(), "failed to release controller lock");
        }
        debug!(path = %self.path.display(), "controller lock released");
    }
}

/// Parse the lock file contents, if present and readable.
pub fn read_lock(path: &Path) -> Option<LockInfo> {
    let contents = std::fs::read_to_string(path).ok()?;
    parse_lock(&contents)
}

fn parse_lock(contents: &str) -> Option<LockInfo> {
    if contents.trim().is_empty() {
        return None;
    }
    match serde_json::from_str(contents) {
        Ok(info) => Some(info),
        Err(err) => {
            debug!(err = %err, "unparseable controller lock");
            None
        }
    }
}

/// The controller currently holding the lock for `plan_location`, if any.
///
/// Never blocks on the holder: a held lock is probed, not waited for.
pub fn live_holder(path: &Path, plan_location: &Path) -> Option<LockHolder> {
    let mut file = match OpenOptions::new().read(true).write(true).open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return None,
        Err(err) => {
            warn!(err = %err, path = %path.display(), "cannot open controller lock");
            return None;
        }
    };
    match FileExt::try_lock_exclusive(&file) {
        Ok(()) => {
            // Nobody holds it, so whatever is written there is left over.
            if let Err(err) = file.set_len(0) {
                debug!(err = %err, "failed to clear stale controller lock");
            }
            if let Err(err) = FileExt::unlock(&file) {
                debug!(err = %err, "failed to release lock probe");
            }
            None
        }
        Err(err) if is_contended(&err) => {
            let holder = wait_for_holder_info(&mut file);
            if let Some(info) = &holder.info
                && info.plan_location != plan_location
            {
                debug!(
                    locked = %info.plan_location.display(),
                    expected = %plan_location.display(),
                    "lock was taken under another plan path"
                );
            }
            Some(holder)
        }
        Err(err) => {
            warn!(err = %err, path = %path.display(), "cannot probe controller lock");
            None
        }
    }
}

fn open_lock_file(path: &Path) -> Result<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(false)
        .open(path)
        .with_context(|| format!("open lock {}", path.display()))
}

fn write_lock_info(file: &mut File, info: &LockInfo) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(info)?;
    buf.push('\n');
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(buf.as_bytes())?;
    file.sync_all()?;
    Ok(())
}

fn is_contended(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

/// Read the holder's info, giving a holder that just locked a moment to write
/// it. Contents naming a dead pid are left over from a crashed controller.
fn wait_for_holder_info(file: &mut File) -> LockHolder {
    for attempt in 0..HOLDER_READ_ATTEMPTS {
        if let Some(info) = read_live_info(file) {
            return LockHolder { info: Some(info) };
        }
        if attempt + 1 < HOLDER_READ_ATTEMPTS {
            thread::sleep(HOLDER_READ_INTERVAL);
        }
    }
    LockHolder { info: None }
}

fn read_live_info(file: &mut File) -> Option<LockInfo> {
    let mut contents = String::new();
    file.seek(SeekFrom::Start(0)).ok()?;
    file.read_to_string(&mut contents).ok()?;
    parse_lock(&contents).filter(|info| process_exists(info.pid))
}

#[cfg(unix)]
fn process_exists(pid: u32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    let Ok(raw) = i32::try_from(pid) else {
        return false;
    };
    match kill(Pid::from_raw(raw), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn process_exists(_pid: u32) -> bool {
    true
}

/// Terminate a running controller: its in-flight child process group first
/// (read from `child_pgid_path`), then the controller itself.
#[cfg(unix)]
pub fn terminate_controller(pid: u32, child_pgid_path: &Path) -> Result<()> {
    use nix::sys::signal::{Signal, kill};
    use nix::unistd::Pid;

    crate::io::process::signal_recorded_group(child_pgid_path, Signal::SIGTERM);
    let raw = i32::try_from(pid).context("controller pid out of range")?;
    kill(Pid::from_raw(raw), Signal::SIGTERM)
        .with_context(|| format!("signal controller pid {raw}"))?;
    info!(pid = raw, "sent SIGTERM to controller");
    Ok(())
}

#[cfg(not(unix))]
pub fn terminate_controller(pid: u32, _child_pgid_path: &Path) -> Result<()> {
    anyhow::bail!("stopping controller pid {pid} is only supported on unix")
}
