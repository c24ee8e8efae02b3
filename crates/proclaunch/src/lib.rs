//! Out-of-process child process launching
//!
//! Spawning children directly from a large multi-threaded host is expensive
//! and racy. `proclaunch` instead keeps one small helper process around
//! (`proclaunch-launcher`), connected over a local socket, and asks it to
//! spawn and supervise children on the host's behalf.
//!
//! # Architecture
//!
//! - **[`LauncherInterface`]** - starts the helper, owns the dispatcher thread
//!   and tears both down again
//! - **[`LauncherSocket`]** - registry of per-process handles and the queue of
//!   outbound requests
//! - **[`CallerHandle`]** - child-process style API owned by one thread, with
//!   blocking waits, buffered output and cancellation
//! - **[`signal`]** - the queue of events waiting to be replayed on the owner
//!   thread
//!
//! All socket I/O happens on a single dispatcher thread. Handles never run
//! callbacks from that thread: events are queued and replayed when the owner
//! flushes, waits or processes events.
//!
//! # Usage
//!
//! ```no_run
//! use proclaunch::{LauncherConfig, LauncherInterface, ProcessEvent, ProcessMode, Token};
//! use std::time::Duration;
//!
//! # fn main() -> proclaunch::Result<()> {
//! let launcher = LauncherInterface::new(LauncherConfig::from_env())?;
//! launcher.start()?;
//!
//! let mut process = launcher.register(Token::next(), ProcessMode::Reader)?;
//! process.on_event(|event| {
//!     if let ProcessEvent::Finished { exit_code, .. } = event {
//!         println!("exited with {exit_code}");
//!     }
//! });
//! process.start("ls", vec!["-l".into()], Vec::<u8>::new())?;
//! process.wait_for_finished(Duration::from_secs(10));
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![cfg(unix)]

pub mod config;
mod dispatcher;
pub mod error;
pub mod handle;
pub mod interface;
pub mod signal;
pub mod socket;

pub use config::LauncherConfig;
pub use error::{LauncherError, Result};
pub use handle::{CallerHandle, CallerRef, ProcessEvent, ProcessSettings, ProcessState};
pub use interface::LauncherInterface;
pub use signal::{SignalQueue, SignalRecord, SignalType};
pub use socket::LauncherSocket;

pub use proclaunch_protocol::{
    ChannelMode, ExitStatus, Packet, PacketType, ProcessErrorKind, ProcessMode, Token,
};
