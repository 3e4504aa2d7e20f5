//! Stage Triggers
//!
//! A mailbox keyed by stage and job that lets the orchestrator and the
//! isolated step processes agree on checkpoints. The step processes share
//! nothing with the orchestrator but a directory, so [`FileMailbox`] is the
//! production channel; [`MemoryMailbox`] serves in-process callers.
//!
//! # File Layout
//!
//! - Stage arrival: `{dir}/.Stage-{Stage}-Start`
//! - Per-step trigger: `{dir}/.Interceptor-Stage-{Stage}-Start-{jobId}`
//!
//! Content is `continue` or `skip`; an empty file means `continue`.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use log::debug;

use crate::error::SyncError;
use crate::workflow::Stage;

/// Default bound for a step process waiting on the Pre stage.
pub const DEFAULT_TRIGGER_TIMEOUT: Duration = Duration::from_secs(30);

/// Interval between mailbox checks while waiting.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Address of one mailbox entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum TriggerKey {
    /// The orchestrator reached the given stage.
    Stage(Stage),
    /// The given job may proceed within the stage.
    Step { stage: Stage, job_id: String },
}

impl TriggerKey {
    pub fn stage(stage: Stage) -> Self {
        TriggerKey::Stage(stage)
    }

    pub fn step(stage: Stage, job_id: impl Into<String>) -> Self {
        TriggerKey::Step {
            stage,
            job_id: job_id.into(),
        }
    }

    /// Deterministic file name of this entry.
    pub fn file_name(&self) -> String {
        match self {
            TriggerKey::Stage(stage) => format!(".Stage-{}-Start", stage),
            TriggerKey::Step { stage, job_id } => {
                format!(".Interceptor-Stage-{}-Start-{}", stage, job_id)
            }
        }
    }
}

impl fmt::Display for TriggerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.file_name())
    }
}

/// Decision delivered through a trigger.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerMessage {
    Continue,
    Skip,
}

impl TriggerMessage {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMessage::Continue => "continue",
            TriggerMessage::Skip => "skip",
        }
    }

    /// Parses trigger content; empty content means `continue`.
    pub fn parse(content: &str) -> Option<Self> {
        match content.trim() {
            "" | "continue" => Some(TriggerMessage::Continue),
            "skip" => Some(TriggerMessage::Skip),
            _ => None,
        }
    }
}

impl fmt::Display for TriggerMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Message passing channel between the orchestrator and step processes.
///
/// `signal` is fire and forget: the last write for a key wins and nothing
/// acknowledges it. `try_read` never blocks; see [`wait_for_trigger`].
pub trait Mailbox: Send + Sync {
    fn signal(&self, key: &TriggerKey, message: TriggerMessage) -> Result<(), SyncError>;

    /// Returns the current message for `key`, if any was signaled.
    fn try_read(&self, key: &TriggerKey) -> Result<Option<TriggerMessage>, SyncError>;
}

/// Mailbox backed by files in a shared directory.
#[derive(Debug, Clone)]
pub struct FileMailbox {
    dir: PathBuf,
}

impl FileMailbox {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &TriggerKey) -> PathBuf {
        self.dir.join(key.file_name())
    }
}

impl Mailbox for FileMailbox {
    fn signal(&self, key: &TriggerKey, message: TriggerMessage) -> Result<(), SyncError> {
        let path = self.path_for(key);
        // Readers treat an empty file as `continue`, so the content must
        // appear atomically: write aside, then rename into place.
        let staging = self.dir.join(format!("{}.tmp", key.file_name()));
        let io_error = |source: io::Error| SyncError::Io {
            path: path.clone(),
            source,
        };
        fs::write(&staging, message.as_str()).map_err(io_error)?;
        fs::rename(&staging, &path).map_err(io_error)?;

        debug!("Signaled {} with '{}'", key, message);
        Ok(())
    }

    fn try_read(&self, key: &TriggerKey) -> Result<Option<TriggerMessage>, SyncError> {
        let path = self.path_for(key);
        let content = match fs::read_to_string(&path) {
            Ok(content) => content,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(SyncError::Io { path, source }),
        };

        TriggerMessage::parse(&content)
            .map(Some)
            .ok_or_else(|| SyncError::UnknownMessage {
                name: key.file_name(),
                message: content.trim().to_string(),
            })
    }
}

/// Mailbox kept in process memory.
#[derive(Debug, Default)]
pub struct MemoryMailbox {
    entries: Mutex<HashMap<TriggerKey, TriggerMessage>>,
}

impl MemoryMailbox {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(
        &self,
        key: &TriggerKey,
    ) -> Result<MutexGuard<'_, HashMap<TriggerKey, TriggerMessage>>, SyncError> {
        self.entries.lock().map_err(|_| SyncError::Poisoned {
            name: key.file_name(),
        })
    }

    /// Returns every signaled entry, for inspection.
    pub fn snapshot(&self) -> HashMap<TriggerKey, TriggerMessage> {
        self.entries
            .lock()
            .map(|entries| entries.clone())
            .unwrap_or_default()
    }
}

impl Mailbox for MemoryMailbox {
    fn signal(&self, key: &TriggerKey, message: TriggerMessage) -> Result<(), SyncError> {
        self.entries(key)?.insert(key.clone(), message);
        Ok(())
    }

    fn try_read(&self, key: &TriggerKey) -> Result<Option<TriggerMessage>, SyncError> {
        Ok(self.entries(key)?.get(key).copied())
    }
}

/// Waits until `key` is signaled and returns its message.
///
/// An entry that already exists is returned immediately. Every poll
/// re-checks existence, so a signal landing between two checks is seen
/// on the next one. With `timeout` set, fails with [`SyncError::Timeout`]
/// once the bound elapses; with `None` it waits indefinitely.
pub async fn wait_for_trigger(
    mailbox: &dyn Mailbox,
    key: &TriggerKey,
    timeout: Option<Duration>,
) -> Result<TriggerMessage, SyncError> {
    let poll = async {
        loop {
            if let Some(message) = mailbox.try_read(key)? {
                debug!("Received '{}' from {}", message, key);
                return Ok(message);
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
    };

    match timeout {
        Some(limit) => tokio::time::timeout(limit, poll)
            .await
            .map_err(|_| SyncError::Timeout {
                name: key.file_name(),
                seconds: limit.as_secs(),
            })?,
        None => poll.await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::tempdir;

    #[test]
    fn test_file_names() {
        assert_eq!(
            TriggerKey::stage(Stage::Pre).file_name(),
            ".Stage-Pre-Start"
        );
        assert_eq!(
            TriggerKey::step(Stage::Main, "Step3").file_name(),
            ".Interceptor-Stage-Main-Start-Step3"
        );
    }

    #[test]
    fn test_message_parse() {
        assert_eq!(TriggerMessage::parse(""), Some(TriggerMessage::Continue));
        assert_eq!(TriggerMessage::parse("continue\n"), Some(TriggerMessage::Continue));
        assert_eq!(TriggerMessage::parse("skip"), Some(TriggerMessage::Skip));
        assert_eq!(TriggerMessage::parse("maybe"), None);
    }

    #[test]
    fn test_file_mailbox_signal_and_read() {
        let temp_dir = tempdir().unwrap();
        let mailbox = FileMailbox::new(temp_dir.path());
        let key = TriggerKey::step(Stage::Main, "Step0");

        assert_eq!(mailbox.try_read(&key).unwrap(), None);
        mailbox.signal(&key, TriggerMessage::Skip).unwrap();

        assert_eq!(mailbox.try_read(&key).unwrap(), Some(TriggerMessage::Skip));
        assert_eq!(
            fs::read_to_string(mailbox.path_for(&key)).unwrap(),
            "skip"
        );
        assert!(!temp_dir
            .path()
            .join(".Interceptor-Stage-Main-Start-Step0.tmp")
            .exists());
    }

    #[test]
    fn test_file_mailbox_empty_file_is_continue() {
        let temp_dir = tempdir().unwrap();
        let mailbox = FileMailbox::new(temp_dir.path());
        let key = TriggerKey::stage(Stage::Post);
        fs::write(mailbox.path_for(&key), "").unwrap();

        assert_eq!(
            mailbox.try_read(&key).unwrap(),
            Some(TriggerMessage::Continue)
        );
    }

    #[test]
    fn test_file_mailbox_unknown_content() {
        let temp_dir = tempdir().unwrap();
        let mailbox = FileMailbox::new(temp_dir.path());
        let key = TriggerKey::stage(Stage::Main);
        fs::write(mailbox.path_for(&key), "later").unwrap();

        assert!(matches!(
            mailbox.try_read(&key),
            Err(SyncError::UnknownMessage { .. })
        ));
    }

    #[test]
    fn test_resignal_last_write_wins() {
        let temp_dir = tempdir().unwrap();
        let mailbox = FileMailbox::new(temp_dir.path());
        let key = TriggerKey::step(Stage::Main, "Step1");

        mailbox.signal(&key, TriggerMessage::Continue).unwrap();
        let consumed = mailbox.try_read(&key).unwrap();

        mailbox.signal(&key, TriggerMessage::Skip).unwrap();

        // An earlier reader keeps what it consumed, a later one sees the update
        assert_eq!(consumed, Some(TriggerMessage::Continue));
        assert_eq!(mailbox.try_read(&key).unwrap(), Some(TriggerMessage::Skip));
    }

    #[test]
    fn test_memory_mailbox() {
        let mailbox = MemoryMailbox::new();
        let key = TriggerKey::stage(Stage::Main);
        assert_eq!(mailbox.try_read(&key).unwrap(), None);

        mailbox.signal(&key, TriggerMessage::Continue).unwrap();
        assert_eq!(
            mailbox.try_read(&key).unwrap(),
            Some(TriggerMessage::Continue)
        );
        assert_eq!(mailbox.snapshot().len(), 1);
    }

    #[test]
    fn test_memory_mailbox_reports_poisoned_lock() {
        let mailbox = MemoryMailbox::new();
        let key = TriggerKey::step(Stage::Main, "Step0");
        let _ = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _entries = mailbox.entries.lock().unwrap();
            panic!("writer failed");
        }));

        assert!(matches!(
            mailbox.signal(&key, TriggerMessage::Continue),
            Err(SyncError::Poisoned { ref name }) if name == ".Interceptor-Stage-Main-Start-Step0"
        ));
        assert!(matches!(mailbox.try_read(&key), Err(SyncError::Poisoned { .. })));
    }

    #[tokio::test]
    async fn test_wait_returns_existing_entry_immediately() {
        let temp_dir = tempdir().unwrap();
        let mailbox = FileMailbox::new(temp_dir.path());
        let key = TriggerKey::stage(Stage::Pre);
        mailbox.signal(&key, TriggerMessage::Continue).unwrap();

        let message = wait_for_trigger(&mailbox, &key, Some(Duration::from_millis(50)))
            .await
            .unwrap();
        assert_eq!(message, TriggerMessage::Continue);
    }

    #[tokio::test]
    async fn test_wait_sees_later_signal() {
        let temp_dir = tempdir().unwrap();
        let mailbox = Arc::new(FileMailbox::new(temp_dir.path()));
        let key = TriggerKey::step(Stage::Main, "Step2");

        let signaler = {
            let mailbox = Arc::clone(&mailbox);
            let key = key.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(150)).await;
                mailbox.signal(&key, TriggerMessage::Skip).unwrap();
            })
        };

        let message = wait_for_trigger(mailbox.as_ref(), &key, Some(Duration::from_secs(5)))
            .await
            .unwrap();
        assert_eq!(message, TriggerMessage::Skip);
        signaler.await.unwrap();
    }

    #[tokio::test]
    async fn test_wait_times_out() {
        let mailbox = MemoryMailbox::new();
        let key = TriggerKey::stage(Stage::Post);

        let result = wait_for_trigger(&mailbox, &key, Some(Duration::from_millis(200))).await;
        assert!(matches!(result, Err(SyncError::Timeout { .. })));
    }
}
