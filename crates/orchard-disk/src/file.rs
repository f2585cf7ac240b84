//! Raw positional file I/O with transient-error retry.

use orchard_common::config::RetryPolicy;
use orchard_common::Result;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tracing::warn;

/// A random-access byte file.
///
/// Reads and writes are positional; consecutive operations at the running
/// cursor skip the seek. Transient failures (short reads, I/O errors,
/// vanished handles) are retried forever at the policy's cadence so a long
/// plot survives a disk that drops out for a while. Only the initial create
/// and `open_existing` can fail fatally.
pub struct FileDisk {
    path: PathBuf,
    file: Option<File>,
    read_pos: u64,
    write_pos: u64,
    write_max: u64,
    reading: bool,
    retry: RetryPolicy,
}

/// Opens `path` read-write, retrying forever at the policy cadence.
fn open_retrying(path: &Path, retry: RetryPolicy) -> File {
    loop {
        match OpenOptions::new().read(true).write(true).create(true).open(path) {
            Ok(f) => return f,
            Err(e) => {
                warn!(
                    "could not open {}: {}. Retrying in {:?}",
                    path.display(),
                    e,
                    retry.backoff
                );
                std::thread::sleep(retry.backoff);
            }
        }
    }
}

impl FileDisk {
    /// Creates (or truncates) the file at `path`.
    pub fn new(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(&path)?;
        Ok(Self {
            path,
            file: Some(file),
            read_pos: 0,
            write_pos: 0,
            write_max: 0,
            reading: true,
            retry,
        })
    }

    /// Opens an existing file without truncating it.
    pub fn open_existing(path: impl Into<PathBuf>, retry: RetryPolicy) -> Result<Self> {
        let path = path.into();
        let file = OpenOptions::new().read(true).write(true).open(&path)?;
        let write_max = file.metadata()?.len();
        Ok(Self {
            path,
            file: Some(file),
            read_pos: 0,
            write_pos: 0,
            write_max,
            reading: true,
            retry,
        })
    }

    /// Path of the backing file.
    pub fn file_name(&self) -> &Path {
        &self.path
    }

    /// Highest byte offset ever written.
    pub fn write_max(&self) -> u64 {
        self.write_max
    }

    /// Takes the open handle, reopening (with retry) if it was closed.
    fn take_file(&mut self) -> File {
        match self.file.take() {
            Some(f) => f,
            None => {
                // Freshly opened handles have no meaningful cursor.
                self.read_pos = u64::MAX;
                self.write_pos = u64::MAX;
                open_retrying(&self.path, self.retry)
            }
        }
    }

    /// Reads exactly `buf.len()` bytes starting at `begin`.
    pub fn read(&mut self, begin: u64, buf: &mut [u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let mut file = self.take_file();
            let pos = begin + done as u64;
            let need_seek = !self.reading || pos != self.read_pos;
            let result = (|| -> std::io::Result<usize> {
                if need_seek {
                    file.seek(SeekFrom::Start(pos))?;
                }
                file.read(&mut buf[done..])
            })();
            match result {
                Ok(n) if n > 0 => {
                    done += n;
                    self.reading = true;
                    self.read_pos = begin + done as u64;
                    self.file = Some(file);
                }
                other => {
                    let detail = match other {
                        Err(e) => e.to_string(),
                        _ => "unexpected end of file".to_string(),
                    };
                    warn!(
                        "only read {} of {} bytes at offset {} from {}: {}. Retrying in {:?}",
                        done,
                        buf.len(),
                        begin,
                        self.path.display(),
                        detail,
                        self.retry.backoff
                    );
                    drop(file);
                    std::thread::sleep(self.retry.backoff);
                }
            }
        }
        Ok(())
    }

    /// Writes all of `buf` starting at `begin`.
    pub fn write(&mut self, begin: u64, buf: &[u8]) -> Result<()> {
        let mut done = 0usize;
        while done < buf.len() {
            let mut file = self.take_file();
            let pos = begin + done as u64;
            let need_seek = self.reading || pos != self.write_pos;
            let result = (|| -> std::io::Result<usize> {
                if need_seek {
                    file.seek(SeekFrom::Start(pos))?;
                }
                file.write(&buf[done..])
            })();
            match result {
                Ok(n) if n > 0 => {
                    done += n;
                    self.reading = false;
                    self.write_pos = begin + done as u64;
                    self.write_max = self.write_max.max(self.write_pos);
                    self.file = Some(file);
                }
                other => {
                    let detail = match other {
                        Err(e) => e.to_string(),
                        _ => "wrote nothing".to_string(),
                    };
                    warn!(
                        "only wrote {} of {} bytes at offset {} to {}: {}. Retrying in {:?}",
                        done,
                        buf.len(),
                        begin,
                        self.path.display(),
                        detail,
                        self.retry.backoff
                    );
                    drop(file);
                    std::thread::sleep(self.retry.backoff);
                }
            }
        }
        Ok(())
    }

    /// Truncates the file to `new_size` bytes. The handle is reopened on
    /// demand by the next read or write.
    pub fn truncate(&mut self, new_size: u64) -> Result<()> {
        self.close();
        let file = OpenOptions::new().write(true).open(&self.path)?;
        file.set_len(new_size)?;
        self.write_max = self.write_max.min(new_size);
        Ok(())
    }

    /// Closes the handle; later operations reopen lazily.
    pub fn close(&mut self) {
        self.file = None;
        self.read_pos = 0;
        self.write_pos = 0;
        self.reading = true;
    }

    /// Closes the handle and deletes the backing file.
    pub fn remove(&mut self) {
        self.close();
        let _ = std::fs::remove_file(&self.path);
    }
}

impl std::fmt::Debug for FileDisk {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileDisk")
            .field("path", &self.path)
            .field("write_max", &self.write_max)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use orchard_common::config::RetryPolicy;
    use tempfile::tempdir;

    fn test_disk(name: &str) -> (FileDisk, tempfile::TempDir) {
        let dir = tempdir().unwrap();
        let disk = FileDisk::new(dir.path().join(name), RetryPolicy::immediate()).unwrap();
        (disk, dir)
    }

    #[test]
    fn test_write_then_read() {
        let (mut disk, _dir) = test_disk("t.tmp");
        disk.write(0, b"hello world").unwrap();

        let mut buf = [0u8; 5];
        disk.read(6, &mut buf).unwrap();
        assert_eq!(&buf, b"world");
        disk.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
    }

    #[test]
    fn test_sequential_writes_extend_write_max() {
        let (mut disk, _dir) = test_disk("t.tmp");
        disk.write(0, &[1u8; 100]).unwrap();
        assert_eq!(disk.write_max(), 100);
        disk.write(100, &[2u8; 50]).unwrap();
        assert_eq!(disk.write_max(), 150);
        // Rewriting earlier bytes does not shrink it.
        disk.write(10, &[3u8; 10]).unwrap();
        assert_eq!(disk.write_max(), 150);
    }

    #[test]
    fn test_sparse_write_reads_zeroes() {
        let (mut disk, _dir) = test_disk("t.tmp");
        disk.write(1000, b"x").unwrap();
        let mut buf = [9u8; 4];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(buf, [0u8; 4]);
    }

    #[test]
    fn test_truncate_and_reopen() {
        let (mut disk, _dir) = test_disk("t.tmp");
        disk.write(0, &[7u8; 256]).unwrap();
        disk.truncate(16).unwrap();
        assert_eq!(disk.write_max(), 16);

        // Handle reopens lazily and the data survives.
        let mut buf = [0u8; 16];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(buf, [7u8; 16]);
    }

    #[test]
    fn test_open_existing_preserves_content() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("keep.tmp");
        {
            let mut disk = FileDisk::new(&path, RetryPolicy::immediate()).unwrap();
            disk.write(0, b"persist").unwrap();
        }
        let mut disk = FileDisk::open_existing(&path, RetryPolicy::immediate()).unwrap();
        assert_eq!(disk.write_max(), 7);
        let mut buf = [0u8; 7];
        disk.read(0, &mut buf).unwrap();
        assert_eq!(&buf, b"persist");
    }

    #[test]
    fn test_open_existing_missing_is_fatal() {
        let dir = tempdir().unwrap();
        let result = FileDisk::open_existing(dir.path().join("nope.tmp"), RetryPolicy::immediate());
        assert!(result.is_err());
    }

    #[test]
    fn test_new_truncates() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("t.tmp");
        {
            let mut disk = FileDisk::new(&path, RetryPolicy::immediate()).unwrap();
            disk.write(0, &[1u8; 64]).unwrap();
        }
        let disk = FileDisk::new(&path, RetryPolicy::immediate()).unwrap();
        assert_eq!(std::fs::metadata(disk.file_name()).unwrap().len(), 0);
    }

    #[test]
    fn test_remove_deletes_file() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("gone.tmp");
        let mut disk = FileDisk::new(&path, RetryPolicy::immediate()).unwrap();
        disk.write(0, b"x").unwrap();
        assert!(path.exists());
        disk.remove();
        assert!(!path.exists());
    }
}
