use std::{
    fs::{self, File, OpenOptions},
    io::{ErrorKind, Seek, SeekFrom, Write},
    path::PathBuf,
    process,
};

use anyhow::{anyhow, Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde::{Deserialize, Serialize};

use crate::infrastructure::directories::ResolvedPaths;

const LOCK_FILENAME: &str = ".postvault.lock";

/// Exclusive runtime lock. The queue engine assumes a single active
/// scheduler per store; holding this lock for the process lifetime makes
/// a second instance on the same host fail fast instead of racing on
/// `dequeue_due`.
#[derive(Debug)]
pub struct InstanceGuard {
    file: File,
    path: PathBuf,
}

#[derive(Debug, Serialize, Deserialize)]
struct LockInfo {
    pid: u32,
    started_at: i64,
}

impl InstanceGuard {
    pub fn acquire(paths: &ResolvedPaths) -> Result<Self> {
        let lock_path = paths.data_dir.join(LOCK_FILENAME);

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(&lock_path)
            .with_context(|| format!("failed to open lock file {}", lock_path.display()))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                write_lock_info(&mut file, process::id())?;
                tracing::info!(
                    target: "lifecycle",
                    pid = process::id(),
                    path = %lock_path.display(),
                    "acquired scheduler instance lock"
                );
                Ok(Self {
                    file,
                    path: lock_path,
                })
            }
            Err(err) if err.kind() == ErrorKind::WouldBlock => {
                let holder = read_lock_info(&lock_path)
                    .ok()
                    .flatten()
                    .map(|info| info.pid);
                Err(anyhow!(
                    "another scheduler instance holds {} (pid {:?}); refusing to start a second one",
                    lock_path.display(),
                    holder
                ))
            }
            Err(err) => Err(err.into()),
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                tracing::warn!(
                    target: "lifecycle",
                    path = %self.path.display(),
                    error = %err,
                    "failed to remove lock file on shutdown"
                );
            }
        }
    }
}

fn write_lock_info(file: &mut File, pid: u32) -> Result<()> {
    let info = LockInfo {
        pid,
        started_at: Utc::now().timestamp_millis(),
    };
    let payload = serde_json::to_vec(&info)?;
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&payload)?;
    file.sync_all()?;
    Ok(())
}

fn read_lock_info(lock_path: &std::path::Path) -> Result<Option<LockInfo>> {
    match fs::read_to_string(lock_path) {
        Ok(contents) if contents.trim().is_empty() => Ok(None),
        Ok(contents) => Ok(serde_json::from_str(&contents).ok()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}
