//! # OS-File Filer
//!
//! [`OsFiler`] is the simplest durable [`Filer`]: positioned reads and
//! writes against a `std::fs::File`, with the size cached so `size()` does
//! not hit the file system. It implements the transaction hooks as balance
//! counting only and offers no structural protection by itself; the
//! transactional wrappers exist for that. Used bare it is suitable for
//! scratch or working data where a crash may discard everything.
//!
//! `punch_hole` validates its arguments and otherwise does nothing, which
//! the filer contract permits: callers treat it as an advisory hint and the
//! old bytes may legitimately read back.
//!
//! The OS handle is released when the value drops; `close` flushes and
//! checks the transaction balance.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use eyre::{Result, WrapErr};

use crate::error::StoreError;
use crate::filer::Filer;

/// A [`Filer`] backed by an OS file via seek-based positioned I/O.
pub struct OsFiler {
    file: File,
    path: PathBuf,
    size: i64,
    nest: usize,
}

impl OsFiler {
    /// Creates (or truncates) the file at `path`.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("failed to create file '{}'", path.display()))?;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size: 0,
            nest: 0,
        })
    }

    /// Opens an existing file at `path`.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .wrap_err_with(|| format!("failed to open file '{}'", path.display()))?;

        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as i64;

        Ok(Self {
            file,
            path: path.to_path_buf(),
            size,
            nest: 0,
        })
    }

    /// Wraps an already-open file, taking its current length as the size.
    pub fn from_file(file: File, path: PathBuf) -> Result<Self> {
        let size = file
            .metadata()
            .wrap_err_with(|| format!("failed to stat '{}'", path.display()))?
            .len() as i64;
        Ok(Self {
            file,
            path,
            size,
            nest: 0,
        })
    }
}

impl Filer for OsFiler {
    fn name(&self) -> String {
        self.path.display().to_string()
    }

    fn size(&mut self) -> Result<i64> {
        Ok(self.size)
    }

    fn read_at(&mut self, buf: &mut [u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "read_at offset",
                value: off,
            }
            .into());
        }

        self.file
            .seek(SeekFrom::Start(off as u64))
            .wrap_err_with(|| format!("failed to seek to {} in '{}'", off, self.path.display()))?;

        let mut done = 0usize;
        while done < buf.len() {
            let n = self
                .file
                .read(&mut buf[done..])
                .wrap_err_with(|| format!("failed to read at {} from '{}'", off, self.path.display()))?;
            if n == 0 {
                break;
            }
            done += n;
        }
        Ok(done)
    }

    fn write_at(&mut self, buf: &[u8], off: i64) -> Result<usize> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "write_at offset",
                value: off,
            }
            .into());
        }

        self.file
            .seek(SeekFrom::Start(off as u64))
            .wrap_err_with(|| format!("failed to seek to {} in '{}'", off, self.path.display()))?;
        self.file
            .write_all(buf)
            .wrap_err_with(|| format!("failed to write at {} to '{}'", off, self.path.display()))?;

        self.size = self.size.max(off + buf.len() as i64);
        Ok(buf.len())
    }

    fn truncate(&mut self, size: i64) -> Result<()> {
        if size < 0 {
            return Err(StoreError::InvalidArgument {
                what: "truncate size",
                value: size,
            }
            .into());
        }

        self.file
            .set_len(size as u64)
            .wrap_err_with(|| format!("failed to truncate '{}' to {}", self.path.display(), size))?;
        self.size = size;
        Ok(())
    }

    fn punch_hole(&mut self, off: i64, size: i64) -> Result<()> {
        if off < 0 {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole offset",
                value: off,
            }
            .into());
        }
        if size < 0 || off + size > self.size {
            return Err(StoreError::InvalidArgument {
                what: "punch_hole size",
                value: size,
            }
            .into());
        }
        // Advisory only; the old bytes may read back, which the contract
        // permits for OS-file filers.
        Ok(())
    }

    fn sync(&mut self) -> Result<()> {
        self.file
            .sync_all()
            .wrap_err_with(|| format!("failed to sync '{}'", self.path.display()))
    }

    fn begin_update(&mut self) -> Result<()> {
        self.nest += 1;
        Ok(())
    }

    fn end_update(&mut self) -> Result<()> {
        if self.nest == 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: end_update outside of a transaction",
                self.name()
            ))
            .into());
        }
        self.nest -= 1;
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        if self.nest == 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: rollback outside of a transaction",
                self.name()
            ))
            .into());
        }
        self.nest -= 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        if self.nest != 0 {
            return Err(StoreError::PermissionDenied(format!(
                "{}: close inside an open transaction",
                self.name()
            ))
            .into());
        }
        self.file
            .flush()
            .wrap_err_with(|| format!("failed to flush '{}'", self.path.display()))
    }
}
