//! System V IPC primitives shared by every process of a run.
//!
//! Four kinds of kernel objects carry the whole simulation:
//! - a counting semaphore bounding waiting-room occupancy ([`semaphore::CapacityGate`])
//! - a binary semaphore guarding the shared counters ([`semaphore::StateMutex`])
//! - one shared memory segment holding [`shared_memory::SharedState`]
//! - priority message queues between stages ([`channel::PriorityChannel`])
//!
//! Objects are addressed by keys derived from a single path ([`keys::IpcKeys`]).
//! The director creates and removes them ([`resources::IpcResources`]); workers
//! open the existing ones ([`resources::IpcHandles::open`]).

pub mod channel;
pub mod keys;
pub mod resources;
pub mod semaphore;
pub mod shared_memory;

pub use channel::{PriorityChannel, RetryPolicy};
pub use keys::IpcKeys;
pub use resources::{IpcHandles, IpcResources};
pub use semaphore::{CapacityGate, StateMutex};
pub use shared_memory::{SharedState, SharedStore};

use nix::errno::Errno;
use std::path::PathBuf;
use thiserror::Error;

/// IPC errors.
#[derive(Debug, Error)]
pub enum IpcError {
    #[error("IPC object removed during {op}")]
    Removed { op: &'static str },

    #[error("{op} interrupted by shutdown")]
    Interrupted { op: &'static str },

    #[error("channel full")]
    Full,

    #[error("no IPC object exists for key {key:#x}")]
    NotFound { key: i32 },

    #[error("cannot derive IPC key from {} (tag '{tag}'): {source}", path.display())]
    KeyDerivation {
        path: PathBuf,
        tag: char,
        #[source]
        source: Errno,
    },

    #[error("{op} failed: {source}")]
    Os {
        op: &'static str,
        #[source]
        source: Errno,
    },

    #[error("invalid argument: {0}")]
    InvalidArgument(String),
}

impl IpcError {
    /// Map the current `errno` after a failed call on an existing object.
    pub(crate) fn last(op: &'static str) -> Self {
        Self::from_errno(op, Errno::last())
    }

    pub(crate) fn from_errno(op: &'static str, errno: Errno) -> Self {
        match errno {
            Errno::EIDRM | Errno::EINVAL => Self::Removed { op },
            source => Self::Os { op, source },
        }
    }

    /// The object behind this handle no longer exists.
    #[must_use]
    pub fn is_removed(&self) -> bool {
        matches!(self, Self::Removed { .. })
    }

    #[must_use]
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    /// Errors that end a worker loop quietly instead of being reported.
    #[must_use]
    pub fn ends_loop(&self) -> bool {
        self.is_removed() || self.is_interrupted()
    }
}

pub type Result<T> = std::result::Result<T, IpcError>;

/// Permission bits for every object we create.
pub(crate) const IPC_MODE: libc::c_int = 0o600;
