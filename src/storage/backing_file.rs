// SPDX-License-Identifier: MIT
// SPDX-FileCopyrightText: 2025-2026 dtn-storage-core contributors
//
// Positioned read/write over a pre-sized backing file. One `BackingFile` is
// owned by exactly one disk-writer worker thread, so all access is
// effectively single-threaded despite using positioned I/O rather than a
// seek+read/write pair. Sized, not grown, at construction — matching the
// storage manager's "no incremental growth once running" contract.

use std::fs::{File, OpenOptions};
use std::io;
use std::path::Path;

pub struct BackingFile {
    file: File,
    len: u64,
}

impl BackingFile {
    /// Open (creating if absent) and ensure the file is exactly `len` bytes.
    pub fn open(path: &Path, len: u64) -> io::Result<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let current_len = file.metadata()?.len();
        if current_len != len {
            file.set_len(len)?;
        }
        Ok(Self { file, len })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn write_at(&self, offset: u64, buf: &[u8]) -> io::Result<()> {
        debug_assert!(offset + buf.len() as u64 <= self.len);
        platform::write_at(&self.file, offset, buf)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        debug_assert!(offset + buf.len() as u64 <= self.len);
        platform::read_at(&self.file, offset, buf)
    }
}

#[cfg(unix)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::unix::fs::FileExt;

    pub fn write_at(file: &File, offset: u64, buf: &[u8]) -> io::Result<()> {
        file.write_all_at(buf, offset)
    }

    pub fn read_at(file: &File, offset: u64, buf: &mut [u8]) -> io::Result<()> {
        file.read_exact_at(buf, offset)
    }
}

#[cfg(windows)]
mod platform {
    use std::fs::File;
    use std::io;
    use std::os::windows::fs::FileExt;

    pub fn write_at(file: &File, mut offset: u64, buf: &[u8]) -> io::Result<()> {
        let mut written = 0usize;
        while written < buf.len() {
            let n = file.seek_write(&buf[written..], offset)?;
            if n == 0 {
                return Err(io::Error::new(io::ErrorKind::WriteZero, "seek_write wrote 0 bytes"));
            }
            written += n;
            offset += n as u64;
        }
        Ok(())
    }

    pub fn read_at(file: &File, mut offset: u64, buf: &mut [u8]) -> io::Result<()> {
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.seek_read(&mut buf[read..], offset)?;
            if n == 0 {
                return Err(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "seek_read reached EOF early",
                ));
            }
            read += n;
            offset += n as u64;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0");
        let bf = BackingFile::open(&path, 4096 * 4).unwrap();
        let payload = [7u8; 4096];
        bf.write_at(4096, &payload).unwrap();
        let mut out = [0u8; 4096];
        bf.read_at(4096, &mut out).unwrap();
        assert_eq!(out, payload);
    }

    #[test]
    fn reopen_preserves_length() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seg0");
        {
            let bf = BackingFile::open(&path, 8192).unwrap();
            assert_eq!(bf.len(), 8192);
        }
        let bf = BackingFile::open(&path, 8192).unwrap();
        assert_eq!(bf.len(), 8192);
    }
}
