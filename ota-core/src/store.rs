// Persistent key-value store collaborator. The orchestrator only needs to
// bring the store up at boot and recover from a layout mismatch; everything
// else (config blobs, wifi credentials) goes through the firmware crate.

use core::fmt;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The on-flash layout does not match what this firmware expects.
    /// Recoverable by erasing and reinitializing the store.
    LayoutMismatch,
    Failed(String),
}

impl fmt::Display for StoreError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StoreError::LayoutMismatch => f.write_str("store layout mismatch"),
            StoreError::Failed(detail) => write!(f, "store failure: {detail}"),
        }
    }
}

impl std::error::Error for StoreError {}

pub trait PersistentStore {
    fn init(&mut self) -> Result<(), StoreError>;

    fn erase(&mut self) -> Result<(), StoreError>;
}
