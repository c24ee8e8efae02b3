//! Process enums shared by both ends of the launcher connection
//!
//! Discriminants are the wire values, so reordering variants changes the
//! protocol.

use serde::{Deserialize, Serialize};

/// Why a process failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessErrorKind {
    /// The program could not be started
    FailedToStart = 0,
    /// The program crashed after starting
    Crashed = 1,
    /// A wait timed out
    Timedout = 2,
    /// Reading from the process failed
    ReadError = 3,
    /// Writing to the process failed
    WriteError = 4,
    /// No error recorded
    #[default]
    UnknownError = 5,
}

impl ProcessErrorKind {
    /// Decode a wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::FailedToStart,
            1 => Self::Crashed,
            2 => Self::Timedout,
            3 => Self::ReadError,
            4 => Self::WriteError,
            5 => Self::UnknownError,
            _ => return None,
        })
    }
}

/// How a process ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ExitStatus {
    /// Process exited on its own
    #[default]
    NormalExit = 0,
    /// Process was killed or crashed
    CrashExit = 1,
}

impl ExitStatus {
    /// Decode a wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::NormalExit),
            1 => Some(Self::CrashExit),
            _ => None,
        }
    }
}

/// Where the child's stdout and stderr go
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ChannelMode {
    /// Both channels are captured separately
    #[default]
    SeparateChannels = 0,
    /// Stderr is captured as part of stdout
    MergedChannels = 1,
    /// Both channels go to the host's own stdout and stderr
    ForwardedChannels = 2,
    /// Stdout goes to the host, stderr is captured
    ForwardedOutputChannel = 3,
    /// Stderr goes to the host, stdout is captured
    ForwardedErrorChannel = 4,
}

impl ChannelMode {
    /// Decode a wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::SeparateChannels,
            1 => Self::MergedChannels,
            2 => Self::ForwardedChannels,
            3 => Self::ForwardedOutputChannel,
            4 => Self::ForwardedErrorChannel,
            _ => return None,
        })
    }

    /// Whether stdout bypasses the capture buffer
    pub fn forwards_stdout(self) -> bool {
        matches!(
            self,
            Self::ForwardedChannels | Self::ForwardedOutputChannel
        )
    }

    /// Whether stderr bypasses the capture buffer
    pub fn forwards_stderr(self) -> bool {
        matches!(self, Self::ForwardedChannels | Self::ForwardedErrorChannel)
    }
}

/// Whether the caller intends to feed the process's stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
#[repr(u8)]
pub enum ProcessMode {
    /// Output only, stdin is closed after the optional write data
    #[default]
    Reader = 0,
    /// Stdin stays open for `WriteIntoProcess` packets
    Writer = 1,
}

impl ProcessMode {
    /// Decode a wire byte
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Reader),
            1 => Some(Self::Writer),
            _ => None,
        }
    }
}
