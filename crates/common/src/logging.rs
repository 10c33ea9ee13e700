use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::MakeWriter;
use tracing_subscriber::EnvFilter;

#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
    Error,
    Warn,
    #[default]
    Info,
    Debug,
    Trace,
}

impl LogLevel {
    pub fn as_directive(self) -> &'static str {
        match self {
            Self::Error => "error",
            Self::Warn => "warn",
            Self::Info => "info",
            Self::Debug => "debug",
            Self::Trace => "trace",
        }
    }

    pub fn from_directive(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "error" => Some(Self::Error),
            "warn" => Some(Self::Warn),
            "info" => Some(Self::Info),
            "debug" => Some(Self::Debug),
            "trace" => Some(Self::Trace),
            _ => None,
        }
    }
}

#[derive(Clone, Debug)]
pub struct LoggingConfig {
    pub level: LogLevel,
    pub log_file: Option<PathBuf>,
    pub rotate_keep: usize,
    pub rotate_max_bytes: u64,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: LogLevel::Info,
            log_file: None,
            rotate_keep: 5,
            rotate_max_bytes: 10 * 1024 * 1024,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LoggingError {
    #[error("logging init failed: {0}")]
    Init(String),
    #[error("logging io failed: {0}")]
    Io(#[from] io::Error),
}

/// Install the global subscriber. `RUST_LOG` overrides the configured level.
pub fn init_logging(config: LoggingConfig) -> Result<(), LoggingError> {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(config.level.as_directive()));

    match config.log_file {
        Some(path) => {
            let rotating = Arc::new(RotatingFile::open(
                path,
                config.rotate_keep,
                config.rotate_max_bytes,
            )?);
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_ansi(false)
                .with_writer(RotatingMakeWriter { rotating })
                .try_init()
                .map_err(|err| LoggingError::Init(err.to_string()))
        }
        None => tracing_subscriber::fmt()
            .with_env_filter(filter)
            .try_init()
            .map_err(|err| LoggingError::Init(err.to_string())),
    }
}

#[derive(Clone)]
struct RotatingMakeWriter {
    rotating: Arc<RotatingFile>,
}

impl<'a> MakeWriter<'a> for RotatingMakeWriter {
    type Writer = RotatingWriter;

    fn make_writer(&'a self) -> Self::Writer {
        RotatingWriter {
            rotating: self.rotating.clone(),
        }
    }
}

struct RotatingWriter {
    rotating: Arc<RotatingFile>,
}

impl Write for RotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.rotating.write(buf)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.rotating.flush()
    }
}

/// Size-rotated log file. Rotated files are gzipped in place and the most
/// recent `keep` archives are retained.
struct RotatingFile {
    state: Mutex<RotatingState>,
    keep: usize,
    max_bytes: u64,
}

struct RotatingState {
    path: PathBuf,
    file: File,
    written: u64,
}

impl RotatingFile {
    fn open(path: PathBuf, keep: usize, max_bytes: u64) -> io::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)?;
        let written = file.metadata()?.len();
        Ok(Self {
            state: Mutex::new(RotatingState {
                path,
                file,
                written,
            }),
            keep,
            max_bytes,
        })
    }

    fn write(&self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log mutex poisoned"))?;
        if state.written.saturating_add(buf.len() as u64) > self.max_bytes {
            self.rotate(&mut state)?;
        }
        let written = state.file.write(buf)?;
        state.written = state.written.saturating_add(written as u64);
        Ok(written)
    }

    fn flush(&self) -> io::Result<()> {
        let mut state = self
            .state
            .lock()
            .map_err(|_| io::Error::other("log mutex poisoned"))?;
        state.file.flush()
    }

    fn rotate(&self, state: &mut RotatingState) -> io::Result<()> {
        state.file.flush()?;
        let stamp = unix_seconds();
        let rotated = PathBuf::from(format!("{}.{stamp}", state.path.to_string_lossy()));
        if state.path.exists() {
            std::fs::rename(&state.path, &rotated)?;
            gzip_in_place(&rotated)?;
        }
        state.file = std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&state.path)?;
        state.written = 0;
        prune_archives(&state.path, self.keep)?;
        Ok(())
    }
}

fn gzip_in_place(path: &Path) -> io::Result<()> {
    let gz_path = PathBuf::from(format!("{}.gz", path.to_string_lossy()));
    let contents = std::fs::read(path)?;
    let mut encoder = GzEncoder::new(File::create(&gz_path)?, Compression::default());
    encoder.write_all(&contents)?;
    encoder.finish()?;
    std::fs::remove_file(path)?;
    Ok(())
}

fn prune_archives(base: &Path, keep: usize) -> io::Result<()> {
    if keep == 0 {
        return Ok(());
    }
    let Some(parent) = base.parent() else {
        return Ok(());
    };
    let base_name = match base.file_name() {
        Some(name) => name.to_string_lossy().to_string(),
        None => return Ok(()),
    };

    let mut archives: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(parent)? {
        let path = entry?.path();
        let name = path.file_name().map(|n| n.to_string_lossy().to_string());
        if let Some(name) = name {
            if name.starts_with(&base_name) && name.ends_with(".gz") {
                archives.push(path);
            }
        }
    }
    // Archive names embed the rotation timestamp, so lexical order is age order.
    archives.sort();
    while archives.len() > keep {
        let oldest = archives.remove(0);
        let _ = std::fs::remove_file(oldest);
    }
    Ok(())
}

fn unix_seconds() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|duration| duration.as_secs())
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::{LogLevel, RotatingFile};

    #[test]
    fn level_directives_round_trip() {
        for level in [
            LogLevel::Error,
            LogLevel::Warn,
            LogLevel::Info,
            LogLevel::Debug,
            LogLevel::Trace,
        ] {
            assert_eq!(LogLevel::from_directive(level.as_directive()), Some(level));
        }
        assert_eq!(LogLevel::from_directive("verbose"), None);
    }

    #[test]
    fn rotation_archives_and_truncates() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("gateway.log");
        let rotating = RotatingFile::open(path.clone(), 3, 64).expect("open");

        for _ in 0..8 {
            rotating
                .write(b"0123456789abcdef0123456789abcdef\n")
                .expect("write");
        }
        rotating.flush().expect("flush");

        let archives = std::fs::read_dir(dir.path())
            .expect("read dir")
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.path().to_string_lossy().ends_with(".gz"))
            .count();
        assert!(archives >= 1);
        let live = std::fs::metadata(&path).expect("live file").len();
        assert!(live <= 64);
    }
}
