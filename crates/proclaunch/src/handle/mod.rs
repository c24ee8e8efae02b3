//! Paired per-process handles
//!
//! Every registered token owns two halves:
//!
//! - a [`CallerHandle`], owned by whichever thread registered it, exposing a
//!   child-process style API (start, write, cancel, blocking waits, buffered
//!   output)
//! - a `LauncherHandle`, driven by the dispatcher thread, which decodes
//!   packets, queues them for the caller and wakes blocked waits
//!
//! The two halves point at each other through `Option<Arc<_>>` slots that
//! are cleared under their locks on unregister, after which every access
//! through the stale half is a no-op.

mod caller;
mod launcher;

pub use caller::{CallerHandle, CallerRef, ProcessSettings};
pub(crate) use caller::CallerShared;
pub(crate) use launcher::{LauncherHandle, WaitOutcome};

use proclaunch_protocol::{ExitStatus, ProcessErrorKind};
use serde::{Deserialize, Serialize};

/// Lifecycle state of a handle's process
///
/// Moves `NotRunning -> Starting -> Running -> NotRunning` exactly once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessState {
    /// Not started yet, or already ended
    #[default]
    NotRunning = 0,
    /// Start requested, not yet confirmed by the helper
    Starting = 1,
    /// The helper reported a successful spawn
    Running = 2,
}

impl ProcessState {
    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            1 => Self::Starting,
            2 => Self::Running,
            _ => Self::NotRunning,
        }
    }
}

/// Event delivered to a [`CallerHandle`] listener while flushing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProcessEvent {
    /// The process was spawned
    Started {
        /// OS process id
        pid: i64,
    },

    /// The process failed
    ErrorOccurred(ProcessErrorKind),

    /// New stdout bytes are buffered
    ReadyReadStandardOutput,

    /// New stderr bytes are buffered
    ReadyReadStandardError,

    /// The process ended
    Finished {
        /// Exit code
        exit_code: i32,
        /// How the process ended
        exit_status: ExitStatus,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_wire_values() {
        for state in [
            ProcessState::NotRunning,
            ProcessState::Starting,
            ProcessState::Running,
        ] {
            assert_eq!(ProcessState::from_u8(state as u8), state);
        }
    }
}
