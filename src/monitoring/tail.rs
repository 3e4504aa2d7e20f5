//! Log File Tailing
//!
//! Follows the nested runner's log file as it grows and yields complete
//! lines. A partial line at the end of the file is held back until its
//! newline arrives.

use std::io::{self, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::debug;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

/// Interval between reads once the end of the file is reached.
const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Where a tail starts reading.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TailStart {
    /// From byte 0
    Beginning,
    /// From the size of the file at open time
    End,
}

/// Follows a growing file line by line.
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    file: File,
    pending: Vec<u8>,
    chunk: Vec<u8>,
}

impl LogTail {
    /// Opens `path` positioned according to `start`.
    pub async fn open(path: &Path, start: TailStart) -> io::Result<Self> {
        let mut file = File::open(path).await?;
        if start == TailStart::End {
            let offset = file.seek(SeekFrom::End(0)).await?;
            debug!("Tailing {} from byte {}", path.display(), offset);
        } else {
            debug!("Tailing {} from start", path.display());
        }

        Ok(Self {
            path: path.to_path_buf(),
            file,
            pending: Vec::new(),
            chunk: vec![0; 8192],
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the next complete line without its terminator, waiting for
    /// the file to grow as long as needed. Invalid UTF-8 is replaced.
    pub async fn next_line(&mut self) -> io::Result<String> {
        loop {
            if let Some(line) = self.take_line() {
                return Ok(line);
            }

            let read = self.file.read(&mut self.chunk).await?;
            if read == 0 {
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            self.pending.extend_from_slice(&self.chunk[..read]);
        }
    }

    fn take_line(&mut self) -> Option<String> {
        let newline = self.pending.iter().position(|&b| b == b'\n')?;
        let mut line: Vec<u8> = self.pending.drain(..=newline).collect();
        line.pop();
        if line.last() == Some(&b'\r') {
            line.pop();
        }
        Some(String::from_utf8_lossy(&line).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::OpenOptions;
    use std::io::Write;
    use tempfile::tempdir;

    fn append(path: &Path, content: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(content.as_bytes()).unwrap();
    }

    #[tokio::test]
    async fn test_tail_from_beginning() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("act.log");
        std::fs::write(&path, "first\nsecond\r\n").unwrap();

        let mut tail = LogTail::open(&path, TailStart::Beginning).await.unwrap();
        assert_eq!(tail.next_line().await.unwrap(), "first");
        assert_eq!(tail.next_line().await.unwrap(), "second");
    }

    #[tokio::test]
    async fn test_tail_from_end_skips_existing_content() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("act.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut tail = LogTail::open(&path, TailStart::End).await.unwrap();
        append(&path, "new line\n");
        assert_eq!(tail.next_line().await.unwrap(), "new line");
    }

    #[tokio::test]
    async fn test_tail_waits_for_partial_line() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("act.log");
        std::fs::write(&path, "par").unwrap();

        let mut tail = LogTail::open(&path, TailStart::Beginning).await.unwrap();

        let writer_path = path.clone();
        let writer = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(120)).await;
            append(&writer_path, "tial\nnext\n");
        });

        assert_eq!(tail.next_line().await.unwrap(), "partial");
        assert_eq!(tail.next_line().await.unwrap(), "next");
        writer.await.unwrap();
    }

    #[tokio::test]
    async fn test_tail_missing_file() {
        let temp_dir = tempdir().unwrap();
        let result = LogTail::open(&temp_dir.path().join("absent.log"), TailStart::End).await;
        assert!(result.is_err());
    }
}
