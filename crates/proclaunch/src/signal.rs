//! Queued process events awaiting replay on the owner thread
//!
//! The dispatcher thread turns packets into [`SignalRecord`]s and appends them
//! to a caller handle's [`SignalQueue`]. The owner thread later drains the
//! queue and replays the records as local callbacks. How much is drained
//! depends on the signal the owner is flushing for, see
//! [`SignalQueue::drain_for`].

use proclaunch_protocol::{ExitStatus, ProcessErrorKind};
use std::collections::VecDeque;

/// Kind of a queued record, also used to name the signal a wait is for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum SignalType {
    /// No particular signal
    #[default]
    NoSignal,
    /// Process error
    Error,
    /// Process started
    Started,
    /// Output available
    ReadyRead,
    /// Process finished
    Finished,
}

/// A decoded process event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalRecord {
    /// The process failed
    Error {
        /// Error category
        kind: ProcessErrorKind,
        /// Human readable error
        message: String,
    },
    /// The process was spawned
    Started {
        /// OS process id
        pid: i64,
    },
    /// Output arrived on one or both channels
    ReadyRead {
        /// Stdout bytes
        stdout: Vec<u8>,
        /// Stderr bytes
        stderr: Vec<u8>,
    },
    /// The process ended
    Finished {
        /// Exit code
        exit_code: i32,
        /// How the process ended
        exit_status: ExitStatus,
    },
}

impl SignalRecord {
    /// Signal kind of this record
    pub fn signal_type(&self) -> SignalType {
        match self {
            Self::Error { .. } => SignalType::Error,
            Self::Started { .. } => SignalType::Started,
            Self::ReadyRead { .. } => SignalType::ReadyRead,
            Self::Finished { .. } => SignalType::Finished,
        }
    }
}

/// FIFO of records for one process, coalescing adjacent output
#[derive(Debug, Default)]
pub struct SignalQueue {
    records: VecDeque<SignalRecord>,
}

impl SignalQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of queued records
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Kinds of the queued records, oldest first
    pub fn signal_types(&self) -> Vec<SignalType> {
        self.records.iter().map(SignalRecord::signal_type).collect()
    }

    /// Append a record, merging it into a trailing ReadyRead
    pub fn push(&mut self, record: SignalRecord) {
        if let (
            Some(SignalRecord::ReadyRead { stdout, stderr }),
            SignalRecord::ReadyRead {
                stdout: more_out,
                stderr: more_err,
            },
        ) = (self.records.back_mut(), &record)
        {
            stdout.extend_from_slice(more_out);
            stderr.extend_from_slice(more_err);
            return;
        }
        self.records.push_back(record);
    }

    /// Whether a wait for `signal` can be satisfied without blocking
    ///
    /// Error and Finished records always end a wait.
    pub fn should_flush_for(&self, signal: SignalType) -> bool {
        self.records.iter().any(|record| {
            let kind = record.signal_type();
            kind == signal || matches!(kind, SignalType::Error | SignalType::Finished)
        })
    }

    /// Remove the records a flush for `signal` replays
    ///
    /// Everything is drained when flushing for NoSignal, ReadyRead or
    /// Finished, and whenever an Error or Finished is queued. Otherwise the
    /// queue is drained up to and including the first record of the requested
    /// kind, with a ReadyRead request falling back to a Started record.
    /// Nothing is drained if no record matches.
    pub fn drain_for(&mut self, signal: SignalType) -> Vec<SignalRecord> {
        let count = self.drain_count(signal);
        self.records.drain(..count).collect()
    }

    fn drain_count(&self, signal: SignalType) -> usize {
        let drain_all = matches!(
            signal,
            SignalType::NoSignal | SignalType::ReadyRead | SignalType::Finished
        ) || self.records.iter().any(|record| {
            matches!(
                record.signal_type(),
                SignalType::Error | SignalType::Finished
            )
        });
        if drain_all {
            return self.records.len();
        }

        let position_of =
            |kind: SignalType| self.records.iter().position(|r| r.signal_type() == kind);
        let matching = match signal {
            SignalType::ReadyRead => {
                position_of(SignalType::ReadyRead).or_else(|| position_of(SignalType::Started))
            }
            other => position_of(other),
        };
        matching.map_or(0, |index| index + 1)
    }
}
