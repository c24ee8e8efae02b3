//! Dispatcher-side half of a handle pair

use super::CallerShared;
use crate::signal::{SignalRecord, SignalType};
use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use proclaunch_protocol::{Packet, PacketType, ProcessErrorKind, ProtocolError, Token};
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tracing::{debug, trace};

/// Result of one blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WaitOutcome {
    /// Records are queued that may satisfy the wait
    Ready,
    /// The deadline passed
    TimedOut,
    /// The handle was canceled or unregistered
    Canceled,
}

struct WaitState {
    caller: Option<Arc<CallerShared>>,
    waiting_for: SignalType,
    canceled: bool,
}

/// Decodes packets for one token and coordinates blocking waits
///
/// Packet handling runs on the dispatcher thread. `wait_for_signal` runs on
/// the caller's thread and parks on the condition variable until the
/// dispatcher wakes it.
pub(crate) struct LauncherHandle {
    token: Token,
    state: Mutex<WaitState>,
    wake: Condvar,
    socket_error: AtomicBool,
}

impl fmt::Debug for LauncherHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherHandle")
            .field("token", &self.token)
            .field("socket_error", &self.is_socket_error())
            .finish_non_exhaustive()
    }
}

impl LauncherHandle {
    pub(crate) fn new(token: Token, socket_error: bool) -> Self {
        Self {
            token,
            state: Mutex::new(WaitState {
                caller: None,
                waiting_for: SignalType::NoSignal,
                canceled: false,
            }),
            wake: Condvar::new(),
            socket_error: AtomicBool::new(socket_error),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub(crate) fn caller(&self) -> Option<Arc<CallerShared>> {
        self.state.lock().caller.clone()
    }

    pub(crate) fn set_caller(&self, caller: Option<Arc<CallerShared>>) {
        self.state.lock().caller = caller;
    }

    pub(crate) fn take_caller(&self) -> Option<Arc<CallerShared>> {
        self.state.lock().caller.take()
    }

    pub(crate) fn is_socket_error(&self) -> bool {
        self.socket_error.load(Ordering::Acquire)
    }

    pub(crate) fn is_canceled(&self) -> bool {
        self.state.lock().canceled
    }

    /// Mark the pending wait as canceled and wake it
    pub(crate) fn set_canceled(&self) {
        let mut state = self.state.lock();
        state.canceled = true;
        self.wake.notify_all();
    }

    /// Decode one inbound packet and queue it for the caller
    ///
    /// A payload that does not decode is a fatal protocol error for the
    /// whole connection.
    pub(crate) fn handle_packet(
        &self,
        packet_type: PacketType,
        payload: Bytes,
    ) -> Result<(), ProtocolError> {
        let packet = Packet::deserialize(packet_type, self.token, payload)?;
        trace!(token = %self.token, ?packet_type, "handling packet");

        match packet {
            Packet::ProcessError {
                error,
                error_string,
                ..
            } => self.deliver(
                SignalType::Error,
                [SignalRecord::Error {
                    kind: error,
                    message: error_string,
                }],
            ),
            Packet::ProcessStarted { pid, .. } => {
                self.deliver(SignalType::Started, [SignalRecord::Started { pid }])
            }
            Packet::ReadyReadStandardOutput { data, .. } => self.deliver_output(data, Bytes::new()),
            Packet::ReadyReadStandardError { data, .. } => self.deliver_output(Bytes::new(), data),
            Packet::ProcessFinished(finished) => {
                let mut records = Vec::with_capacity(3);
                if finished.error != ProcessErrorKind::UnknownError {
                    records.push(SignalRecord::Error {
                        kind: finished.error,
                        message: finished.error_string,
                    });
                }
                if !finished.std_out.is_empty() || !finished.std_err.is_empty() {
                    records.push(SignalRecord::ReadyRead {
                        stdout: finished.std_out.to_vec(),
                        stderr: finished.std_err.to_vec(),
                    });
                }
                records.push(SignalRecord::Finished {
                    exit_code: finished.exit_code,
                    exit_status: finished.exit_status,
                });
                self.deliver(SignalType::Finished, records);
            }
            Packet::Shutdown { .. }
            | Packet::StartProcess(_)
            | Packet::WriteIntoProcess { .. }
            | Packet::StopProcess { .. } => {
                return Err(ProtocolError::UnknownPacketType(packet_type as u8));
            }
        }
        Ok(())
    }

    /// The connection came up: send any start request held back so far
    pub(crate) fn handle_socket_ready(&self) {
        self.socket_error.store(false, Ordering::Release);
        let state = self.state.lock();
        if let Some(caller) = &state.caller {
            caller.start_if_needed();
        }
    }

    /// The connection failed: fail the process with a synthetic error
    pub(crate) fn handle_socket_error(&self, message: &str) {
        self.socket_error.store(true, Ordering::Release);
        self.deliver(
            SignalType::Error,
            [SignalRecord::Error {
                kind: ProcessErrorKind::FailedToStart,
                message: format!("Internal socket error: {message}"),
            }],
        );
    }

    /// Block until a record that may satisfy `signal` is queued
    ///
    /// Returns immediately if one is already queued. Without a deadline only a
    /// wake or a cancel ends the wait. Called from the caller's thread only.
    pub(crate) fn wait_for_signal(
        &self,
        deadline: Option<Instant>,
        signal: SignalType,
    ) -> WaitOutcome {
        let mut state = self.state.lock();
        if state.canceled {
            return WaitOutcome::Canceled;
        }
        let Some(caller) = state.caller.clone() else {
            return WaitOutcome::Canceled;
        };
        if caller.should_flush_for(signal) {
            return WaitOutcome::Ready;
        }

        state.waiting_for = signal;
        let timed_out = match deadline {
            Some(deadline) => self.wake.wait_until(&mut state, deadline).timed_out(),
            None => {
                self.wake.wait(&mut state);
                false
            }
        };
        state.waiting_for = SignalType::NoSignal;

        if state.canceled {
            WaitOutcome::Canceled
        } else if timed_out {
            WaitOutcome::TimedOut
        } else {
            WaitOutcome::Ready
        }
    }

    fn deliver_output(&self, stdout: Bytes, stderr: Bytes) {
        let state = self.state.lock();
        wake_if_waiting_for(&self.wake, state.waiting_for, SignalType::ReadyRead);
        // Empty chunks still wake a waiter but are not queued.
        if stdout.is_empty() && stderr.is_empty() {
            return;
        }
        if let Some(caller) = &state.caller {
            caller.append_signal(SignalRecord::ReadyRead {
                stdout: stdout.to_vec(),
                stderr: stderr.to_vec(),
            });
            caller.request_flush();
        }
    }

    /// Wake, then append while still holding the lock so a woken waiter
    /// always sees the new records
    fn deliver(&self, signal: SignalType, records: impl IntoIterator<Item = SignalRecord>) {
        let state = self.state.lock();
        wake_if_waiting_for(&self.wake, state.waiting_for, signal);
        let Some(caller) = &state.caller else {
            debug!(token = %self.token, ?signal, "dropping signal for unregistered caller");
            return;
        };
        for record in records {
            caller.append_signal(record);
        }
        caller.request_flush();
    }
}

/// Whether a wait for `waiting_for` must be woken by `signal`
pub(crate) fn should_wake(waiting_for: SignalType, signal: SignalType) -> bool {
    let matched = waiting_for == signal;
    let ends_wait = waiting_for != SignalType::NoSignal
        && matches!(signal, SignalType::Error | SignalType::Finished);
    // Woken to flush, then the wait continues.
    let intermediate = (waiting_for == SignalType::Finished && signal != SignalType::Finished)
        || (waiting_for == SignalType::ReadyRead && signal == SignalType::Started);
    matched || ends_wait || intermediate
}

fn wake_if_waiting_for(wake: &Condvar, waiting_for: SignalType, signal: SignalType) {
    if should_wake(waiting_for, signal) {
        wake.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;
    use std::time::Duration;

    #[rstest]
    #[case(SignalType::Started, SignalType::Started, true)]
    #[case(SignalType::Started, SignalType::ReadyRead, false)]
    #[case(SignalType::Started, SignalType::Error, true)]
    #[case(SignalType::Started, SignalType::Finished, true)]
    #[case(SignalType::ReadyRead, SignalType::Started, true)]
    #[case(SignalType::ReadyRead, SignalType::ReadyRead, true)]
    #[case(SignalType::Finished, SignalType::Started, true)]
    #[case(SignalType::Finished, SignalType::ReadyRead, true)]
    #[case(SignalType::NoSignal, SignalType::Error, false)]
    #[case(SignalType::NoSignal, SignalType::Finished, false)]
    #[case(SignalType::NoSignal, SignalType::Started, false)]
    fn test_wake_rules(
        #[case] waiting_for: SignalType,
        #[case] signal: SignalType,
        #[case] expected: bool,
    ) {
        assert_eq!(should_wake(waiting_for, signal), expected);
    }

    #[test]
    fn test_wait_without_caller_returns_canceled() {
        let handle = LauncherHandle::new(Token::new(1), false);
        let outcome = handle.wait_for_signal(
            Some(Instant::now() + Duration::from_secs(5)),
            SignalType::Finished,
        );
        assert_eq!(outcome, WaitOutcome::Canceled);
    }

    #[test]
    fn test_canceled_flag_is_sticky() {
        let handle = LauncherHandle::new(Token::new(1), false);
        assert!(!handle.is_canceled());
        handle.set_canceled();
        assert!(handle.is_canceled());
    }

    #[test]
    fn test_socket_error_flag() {
        let handle = LauncherHandle::new(Token::new(1), true);
        assert!(handle.is_socket_error());
        handle.handle_socket_ready();
        assert!(!handle.is_socket_error());
        handle.handle_socket_error("gone");
        assert!(handle.is_socket_error());
    }

    #[test]
    fn test_host_bound_packet_is_rejected() {
        let handle = LauncherHandle::new(Token::new(1), false);
        let err = handle
            .handle_packet(PacketType::StopProcess, Bytes::new())
            .unwrap_err();
        assert_eq!(
            err,
            ProtocolError::UnknownPacketType(PacketType::StopProcess as u8)
        );
    }

    #[test]
    fn test_undecodable_payload_is_rejected() {
        let handle = LauncherHandle::new(Token::new(1), false);
        assert!(
            handle
                .handle_packet(PacketType::ProcessStarted, Bytes::from_static(b"\x01"))
                .is_err()
        );
    }
}
