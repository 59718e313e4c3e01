//! A log file that rotates by size.
//!
//! `confpush.log` is the live file. When a write would push it past the size cap, the backups
//! shift up by one (`confpush.log.1` becomes `confpush.log.2`, and so on), the oldest backup falls
//! off the end, the live file becomes `confpush.log.1`, and a fresh live file is started.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

/// Opens a log file for appending, or creates it if it did not exist.
fn open_log_file(path: impl AsRef<Path>) -> io::Result<File> {
    OpenOptions::new()
        .append(true)
        .create(true)
        .open(path.as_ref())
}

/// An append-only file that rotates itself once it reaches `max_bytes`.
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,

    /// Zero disables rotation.
    max_bytes: u64,

    /// How many rotated files to keep. With zero, the live file is truncated instead.
    backups: usize,

    file: File,

    /// Current size of the live file.
    len: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, max_bytes: u64, backups: usize) -> io::Result<Self> {
        let path = path.into();
        let file = open_log_file(&path)?;
        let len = file.metadata()?.len();
        Ok(RotatingFile {
            path,
            max_bytes,
            backups,
            file,
            len,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// The path of the `n`th backup, e.g. `confpush.log.3`.
    pub fn backup_path(&self, n: usize) -> PathBuf {
        let mut path = OsString::from(self.path.as_os_str());
        path.push(format!(".{n}"));
        PathBuf::from(path)
    }

    fn needs_rotation(&self, incoming: usize) -> bool {
        // Never rotate an empty file: a single entry larger than the cap still has to go somewhere.
        self.max_bytes > 0 && self.len > 0 && self.len + incoming as u64 > self.max_bytes
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.file.flush()?;

        if self.backups == 0 {
            self.file = OpenOptions::new()
                .write(true)
                .truncate(true)
                .create(true)
                .open(&self.path)?;
            self.len = 0;
            return Ok(());
        }

        for n in (1..self.backups).rev() {
            let from = self.backup_path(n);
            if from.try_exists()? {
                replace(&from, &self.backup_path(n + 1))?;
            }
        }
        replace(&self.path, &self.backup_path(1))?;

        self.file = open_log_file(&self.path)?;
        self.len = 0;
        Ok(())
    }
}

/// Renames `from` to `to`, removing `to` first if it exists.
fn replace(from: &Path, to: &Path) -> io::Result<()> {
    if to.try_exists()? {
        fs::remove_file(to)?;
    }
    fs::rename(from, to)
}

impl Write for RotatingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.needs_rotation(buf.len()) {
            self.rotate()?;
        }
        let written = self.file.write(buf)?;
        self.len += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.file.flush()
    }
}
