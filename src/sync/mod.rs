//! Cross-Process Synchronization
//!
//! Checkpoints between the orchestrator and the isolated step processes.
//!
//! - [`trigger`]: Mailbox abstraction, file and in-memory implementations

pub mod trigger;

pub use trigger::{
    wait_for_trigger, FileMailbox, Mailbox, MemoryMailbox, TriggerKey, TriggerMessage,
    DEFAULT_TRIGGER_TIMEOUT,
};
