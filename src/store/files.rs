//! Store files
//!
//! Positioned reads and writes on the metadata and header/payload files.
//! Handles are shared between threads; callers hold the slot lock for every
//! slot they touch, so concurrent byte ranges never overlap.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::{Path, PathBuf};

use super::entry::{EntryLayout, METADATA_LENGTH};
use crate::error::Result;

/// Read exactly `buf.len()` bytes at `pos`
#[cfg(unix)]
pub(crate) fn read_at(file: &File, buf: &mut [u8], pos: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, pos)
}

/// Write all of `buf` at `pos`
#[cfg(unix)]
pub(crate) fn write_at(file: &File, buf: &[u8], pos: u64) -> io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, pos)
}

#[cfg(windows)]
pub(crate) fn read_at(file: &File, mut buf: &mut [u8], mut pos: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_read(buf, pos) {
            Ok(0) => return Err(io::ErrorKind::UnexpectedEof.into()),
            Ok(n) => {
                buf = &mut buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

#[cfg(windows)]
pub(crate) fn write_at(file: &File, mut buf: &[u8], mut pos: u64) -> io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        match file.seek_write(buf, pos) {
            Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
            Ok(n) => {
                buf = &buf[n..];
                pos += n as u64;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }
    Ok(())
}

/// The per-slot data files of one store
pub(crate) struct StoreFiles {
    meta_path: PathBuf,
    hd_path: PathBuf,
    meta: File,
    hd: File,
    hd_record_len: u64,
}

impl StoreFiles {
    /// Open (or create) `<name>.metadata` and `<name>.hd` in `dir`
    pub fn open(dir: &Path, name: &str, layout: &EntryLayout) -> Result<Self> {
        let meta_path = dir.join(format!("{}.metadata", name));
        let hd_path = dir.join(format!("{}.hd", name));

        let open = |path: &Path| {
            OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .truncate(false)
                .open(path)
        };

        Ok(Self {
            meta: open(&meta_path)?,
            hd: open(&hd_path)?,
            meta_path,
            hd_path,
            hd_record_len: layout.hd_record_len() as u64,
        })
    }

    /// Read one metadata record; a slot past end of file reads as free
    pub fn read_metadata(&self, offset: u64) -> Result<[u8; METADATA_LENGTH]> {
        let mut buf = [0u8; METADATA_LENGTH];
        match read_at(&self.meta, &mut buf, offset * METADATA_LENGTH as u64) {
            Ok(()) => Ok(buf),
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                tracing::debug!(offset, "Metadata read past end of file");
                Ok([0u8; METADATA_LENGTH])
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read `count` consecutive metadata records starting at `offset`
    ///
    /// Records past end of file come back zeroed (free).
    pub fn read_metadata_range(&self, offset: u64, count: u64) -> Result<Vec<u8>> {
        let start = offset * METADATA_LENGTH as u64;
        let wanted = count * METADATA_LENGTH as u64;
        let file_len = self.meta.metadata()?.len();
        let available = file_len.saturating_sub(start).min(wanted);

        let mut buf = vec![0u8; wanted as usize];
        if available > 0 {
            read_at(&self.meta, &mut buf[..available as usize], start)?;
        }
        Ok(buf)
    }

    pub fn write_metadata(&self, offset: u64, record: &[u8]) -> Result<()> {
        write_at(&self.meta, record, offset * METADATA_LENGTH as u64)?;
        Ok(())
    }

    /// Write back a range read with [`read_metadata_range`](Self::read_metadata_range)
    pub fn write_metadata_range(&self, offset: u64, records: &[u8]) -> Result<()> {
        write_at(&self.meta, records, offset * METADATA_LENGTH as u64)?;
        Ok(())
    }

    pub fn read_hd(&self, offset: u64) -> Result<Vec<u8>> {
        let mut buf = vec![0u8; self.hd_record_len as usize];
        read_at(&self.hd, &mut buf, offset * self.hd_record_len)?;
        Ok(buf)
    }

    pub fn write_hd(&self, offset: u64, record: &[u8]) -> Result<()> {
        write_at(&self.hd, record, offset * self.hd_record_len)?;
        Ok(())
    }

    /// Size both files for `slots` slots
    pub fn set_slot_count(&self, slots: u64) -> Result<()> {
        self.meta.set_len(slots * METADATA_LENGTH as u64)?;
        self.hd.set_len(slots * self.hd_record_len)?;
        Ok(())
    }

    /// Number of slots the metadata file currently covers
    pub fn slot_count(&self) -> Result<u64> {
        Ok(self.meta.metadata()?.len() / METADATA_LENGTH as u64)
    }

    /// Discard every record
    pub fn wipe(&self) -> Result<()> {
        tracing::warn!(
            meta = %self.meta_path.display(),
            hd = %self.hd_path.display(),
            "Wiping store data files"
        );
        self.meta.set_len(0)?;
        self.hd.set_len(0)?;
        Ok(())
    }

    pub fn sync(&self) -> Result<()> {
        self.meta.sync_all()?;
        self.hd.sync_all()?;
        Ok(())
    }
}
