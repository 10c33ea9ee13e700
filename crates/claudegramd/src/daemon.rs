//! Process-level plumbing: CLI arguments and the PID-file singleton lock.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
#[error("daemon error: {message}")]
pub struct DaemonError {
    message: String,
}

impl DaemonError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[derive(Clone, Debug, Default)]
pub struct CliArgs {
    pub env_file: Option<PathBuf>,
    pub project_dir: Option<PathBuf>,
    pub log_file: Option<PathBuf>,
}

impl CliArgs {
    pub fn parse() -> Result<Self, DaemonError> {
        let mut args = std::env::args().skip(1);
        let mut cli = Self::default();

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--env-file" => {
                    let Some(path) = args.next() else {
                        return Err(DaemonError::new("missing value for --env-file"));
                    };
                    cli.env_file = Some(PathBuf::from(path));
                }
                "--project-dir" => {
                    let Some(path) = args.next() else {
                        return Err(DaemonError::new("missing value for --project-dir"));
                    };
                    cli.project_dir = Some(PathBuf::from(path));
                }
                "--log-file" => {
                    let Some(path) = args.next() else {
                        return Err(DaemonError::new("missing value for --log-file"));
                    };
                    cli.log_file = Some(PathBuf::from(path));
                }
                other => {
                    return Err(DaemonError::new(format!("unknown argument: {other}")));
                }
            }
        }

        Ok(cli)
    }
}

/// Exclusive-create PID lock. A live holder blocks startup; a stale file
/// from a crashed run is overwritten.
pub struct PidLock {
    path: PathBuf,
}

impl PidLock {
    pub fn acquire(path: PathBuf) -> Result<Self, DaemonError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|err| DaemonError::new(format!("pid dir create failed: {err}")))?;
        }

        let pid = std::process::id();
        match exclusive_write(&path, pid) {
            Ok(()) => return Ok(Self { path }),
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {}
            Err(err) => {
                return Err(DaemonError::new(format!("pid file create failed: {err}")));
            }
        }

        match read_pid(&path) {
            Some(holder) if pid_alive(holder) => Err(DaemonError::new(format!(
                "another instance is already running (pid {holder})"
            ))),
            holder => {
                if let Some(holder) = holder {
                    tracing::warn!("overwriting stale pid file left by pid {holder}");
                }
                std::fs::write(&path, format!("{pid}\n"))
                    .map_err(|err| DaemonError::new(format!("pid file write failed: {err}")))?;
                Ok(Self { path })
            }
        }
    }

    /// Remove the file, but only when it still holds our pid.
    pub fn release(&self) {
        if read_pid(&self.path) == Some(std::process::id() as i32) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

impl Drop for PidLock {
    fn drop(&mut self) {
        self.release();
    }
}

fn exclusive_write(path: &Path, pid: u32) -> std::io::Result<()> {
    use std::io::Write;
    let mut file = std::fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;
    file.write_all(format!("{pid}\n").as_bytes())
}

fn read_pid(path: &Path) -> Option<i32> {
    std::fs::read_to_string(path)
        .ok()
        .and_then(|raw| raw.trim().parse::<i32>().ok())
}

/// Zero-signal liveness probe. EPERM means the pid exists but belongs to
/// someone else, which still counts as alive.
#[cfg(unix)]
fn pid_alive(pid: i32) -> bool {
    use nix::errno::Errno;
    use nix::sys::signal::kill;
    use nix::unistd::Pid;
    match kill(Pid::from_raw(pid), None) {
        Ok(()) => true,
        Err(Errno::EPERM) => true,
        Err(_) => false,
    }
}

#[cfg(not(unix))]
fn pid_alive(_pid: i32) -> bool {
    false
}

/// Delete files older than `max_age_secs` under `dir`. Returns how many
/// were removed.
pub fn cleanup_stale_uploads(dir: &Path, max_age_secs: u64) -> usize {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(_) => return 0,
    };

    let now = std::time::SystemTime::now();
    let mut removed = 0usize;
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() {
            continue;
        }
        let age = entry
            .metadata()
            .and_then(|meta| meta.modified())
            .ok()
            .and_then(|modified| now.duration_since(modified).ok());
        if let Some(age) = age {
            if age.as_secs() > max_age_secs {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(err) => tracing::warn!("upload cleanup failed for {path:?}: {err}"),
                }
            }
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::{cleanup_stale_uploads, read_pid, PidLock};

    #[test]
    fn lock_round_trip_and_stale_takeover() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.pid");

        let lock = PidLock::acquire(path.clone()).expect("acquire");
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));

        lock.release();
        assert!(!path.exists());

        // A stale file with an impossible pid must be overwritten.
        std::fs::write(&path, "999999999\n").expect("write stale");
        let _lock = PidLock::acquire(path.clone()).expect("take over stale lock");
        assert_eq!(read_pid(&path), Some(std::process::id() as i32));
    }

    #[test]
    fn live_holder_blocks_acquisition() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.pid");
        // Our own pid is definitely alive.
        std::fs::write(&path, format!("{}\n", std::process::id())).expect("write");

        // A second acquire against a live holder must fail...
        let result = PidLock::acquire(path.clone());
        assert!(result.is_err());
        // ...and must not delete the holder's file.
        assert!(path.exists());
    }

    #[test]
    fn release_leaves_foreign_pid_files_alone() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.pid");
        let lock = PidLock::acquire(path.clone()).expect("acquire");

        // Simulate another process having replaced the file.
        std::fs::write(&path, "4242\n").expect("write");
        lock.release();
        assert!(path.exists());
        let _ = std::fs::remove_file(&path);
        std::mem::forget(lock);
    }

    #[test]
    fn upload_cleanup_removes_only_old_files() {
        let dir = tempfile::tempdir().expect("tempdir");
        let old = dir.path().join("old.ogg");
        let fresh = dir.path().join("fresh.ogg");
        std::fs::write(&old, b"old").expect("write");
        std::fs::write(&fresh, b"fresh").expect("write");

        let stale_time = std::time::SystemTime::now() - std::time::Duration::from_secs(100_000);
        let file = std::fs::File::options().write(true).open(&old).expect("open");
        file.set_modified(stale_time).expect("set mtime");
        drop(file);

        let removed = cleanup_stale_uploads(dir.path(), 86_400);
        assert_eq!(removed, 1);
        assert!(!old.exists());
        assert!(fresh.exists());
    }
}
