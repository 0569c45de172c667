use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use fanout_api::{BatchedWriter, date_from_ms, now_ms};
use fanout_pipeline::{DeliveryError, SinkFactory};

// ════════════════════════════════════════════════════════════════
//  FileWriter
// ════════════════════════════════════════════════════════════════

/// Append-only handle on the active file.
pub struct FileWriter {
    file: File,
    path: PathBuf,
    name: String,
    size: u64,
}

impl FileWriter {
    fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let size = file.metadata()?.len();
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| path.display().to_string());
        Ok(Self { file, path: path.to_path_buf(), name, size })
    }
}

impl Write for FileWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.file.write(buf)?;
        self.size += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}

impl BatchedWriter for FileWriter {
    fn name(&self) -> &str {
        &self.name
    }

    fn size(&self) -> u64 {
        self.size
    }

    fn is_accessible(&self) -> bool {
        self.path.exists()
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.flush()?;
        self.file.sync_data()
    }
}

// ════════════════════════════════════════════════════════════════
//  FileSink
// ════════════════════════════════════════════════════════════════

/// Opens the active file and moves it aside on rotation as
/// `<stem>_<YYYY-MM-DD>_<n>.<ext>`.
pub struct FileSink {
    path: PathBuf,
    create_dirs: bool,
    rotate_size: Option<u64>,
    rotate_age: Option<Duration>,
}

impl FileSink {
    pub fn new(path: impl Into<PathBuf>, create_dirs: bool) -> Self {
        Self { path: path.into(), create_dirs, rotate_size: None, rotate_age: None }
    }

    pub fn with_rotate_size(mut self, bytes: Option<u64>) -> Self {
        self.rotate_size = bytes.filter(|b| *b > 0);
        self
    }

    pub fn with_rotate_age(mut self, age: Option<Duration>) -> Self {
        self.rotate_age = age.filter(|a| !a.is_zero());
        self
    }

    /// First free rotated name for today.
    fn rotated_path(&self) -> PathBuf {
        let stem = self.path.file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let ext = self.path.extension().map(|e| e.to_string_lossy().into_owned());
        let date = date_from_ms(now_ms());
        let dir = self.path.parent().unwrap_or_else(|| Path::new(""));

        let mut n = 0u32;
        loop {
            let name = match &ext {
                Some(ext) => format!("{stem}_{date}_{n}.{ext}"),
                None => format!("{stem}_{date}_{n}"),
            };
            let candidate = dir.join(name);
            if !candidate.exists() {
                return candidate;
            }
            n += 1;
        }
    }
}

impl SinkFactory for FileSink {
    fn open(&mut self) -> Result<Box<dyn BatchedWriter>, DeliveryError> {
        if self.create_dirs {
            if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent).map_err(|e| {
                    DeliveryError::ResourceUnavailable(format!("mkdir {}: {e}", parent.display()))
                })?;
            }
        }
        let writer = FileWriter::open(&self.path).map_err(|e| {
            DeliveryError::ResourceUnavailable(format!("open {}: {e}", self.path.display()))
        })?;
        Ok(Box::new(writer))
    }

    fn needs_rotation(&self, writer: &dyn BatchedWriter, age: Duration) -> bool {
        self.rotate_size.is_some_and(|limit| writer.size() >= limit)
            || self.rotate_age.is_some_and(|limit| age >= limit)
    }

    fn rotated(&mut self) {
        let target = self.rotated_path();
        match std::fs::rename(&self.path, &target) {
            Ok(()) => tracing::info!(from = %self.path.display(), to = %target.display(), "file rotated"),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => tracing::error!(path = %self.path.display(), error = %e, "file rotation failed"),
        }
    }
}
