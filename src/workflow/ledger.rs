//! Failed Step Ledger
//!
//! Append-only record of step indices that ended in failure, shared by
//! the stage invocations of one run.
//!
//! The ledger is saved to `{temp_dir}/.error-steps`, one index per line.
//! A later stage re-reads it at start so that a failure observed during
//! Main is still accounted for in Post.

use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};

/// File name of the ledger inside the temp directory.
pub const LEDGER_FILE_NAME: &str = ".error-steps";

#[derive(Debug, Clone)]
pub struct ErrorLedger {
    path: PathBuf,
}

impl ErrorLedger {
    /// Creates a ledger handle for the given temp directory.
    pub fn new(temp_dir: &Path) -> Self {
        Self {
            path: temp_dir.join(LEDGER_FILE_NAME),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Creates the ledger file if it does not exist yet.
    pub fn ensure_exists(&self) -> io::Result<()> {
        OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map(|_| ())
    }

    /// Empties the ledger, used when a fresh run starts.
    pub fn reset(&self) -> io::Result<()> {
        fs::write(&self.path, "")
    }

    /// Appends a failed step index.
    pub fn record(&self, index: usize) -> io::Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        writeln!(file, "{}", index)?;
        debug!("Recorded failed step {} in {}", index, self.path.display());
        Ok(())
    }

    /// Loads all recorded indices in order, without duplicates.
    ///
    /// A missing ledger is empty. Lines that are not indices are skipped.
    pub fn load(&self) -> io::Result<Vec<usize>> {
        let content = match fs::read_to_string(&self.path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let mut indices = Vec::new();
        for line in content.lines().map(str::trim).filter(|line| !line.is_empty()) {
            match line.parse::<usize>() {
                Ok(index) if !indices.contains(&index) => indices.push(index),
                Ok(_) => {}
                Err(_) => warn!("Ignoring malformed ledger entry: {:?}", line),
            }
        }
        Ok(indices)
    }
}
