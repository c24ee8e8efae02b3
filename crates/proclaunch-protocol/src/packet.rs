//! Packet definitions and payload encoding
//!
//! Every frame on the wire is
//!
//! ```text
//! [u32 size][u8 type][u64 token][payload]
//! ```
//!
//! with all integers little-endian and `size` counting every byte after the
//! size field itself. Payload fields use a small fixed vocabulary:
//!
//! - byte arrays and strings: `u32` length followed by the raw bytes (UTF-8 for strings)
//! - string lists: `u32` count followed by that many strings
//! - bools and enums: one byte
//! - pid: `i64`, exit code: `i32`

use crate::error::{ProtocolError, Result};
use crate::token::Token;
use crate::types::{ChannelMode, ExitStatus, ProcessErrorKind, ProcessMode};
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Length of the leading size field
pub const SIZE_FIELD_LEN: usize = 4;

/// Smallest legal value of the size field: type byte plus token
pub const HEADER_SIZE: usize = 1 + 8;

/// Largest legal value of the size field
///
/// Writers split larger payloads; readers treat anything above it as a
/// corrupt frame.
pub const MAX_PACKET_SIZE: usize = 256 * 1024 * 1024;

/// Discriminant byte of each packet kind
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum PacketType {
    /// Host asks the helper to exit
    Shutdown = 0,
    /// Host asks the helper to spawn a process
    StartProcess = 1,
    /// Host sends bytes to a process's stdin
    WriteIntoProcess = 2,
    /// Host asks the helper to kill a process
    StopProcess = 3,
    /// Helper reports a process error
    ProcessError = 4,
    /// Helper reports a successful spawn
    ProcessStarted = 5,
    /// Helper forwards stdout bytes
    ReadyReadStandardOutput = 6,
    /// Helper forwards stderr bytes
    ReadyReadStandardError = 7,
    /// Helper reports that a process ended
    ProcessFinished = 8,
}

impl PacketType {
    /// Decode a type byte
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Shutdown,
            1 => Self::StartProcess,
            2 => Self::WriteIntoProcess,
            3 => Self::StopProcess,
            4 => Self::ProcessError,
            5 => Self::ProcessStarted,
            6 => Self::ReadyReadStandardOutput,
            7 => Self::ReadyReadStandardError,
            8 => Self::ProcessFinished,
            _ => return None,
        })
    }

    /// Whether this packet travels from the host to the helper
    pub fn is_host_request(self) -> bool {
        matches!(
            self,
            Self::Shutdown | Self::StartProcess | Self::WriteIntoProcess | Self::StopProcess
        )
    }
}

/// Everything the helper needs to spawn one process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct StartProcess {
    /// Process token
    pub token: Token,
    /// Program to run
    pub command: String,
    /// Program arguments
    pub arguments: Vec<String>,
    /// Working directory, empty for the helper's own
    pub working_dir: String,
    /// Environment as `KEY=VALUE` entries, empty to inherit the helper's
    pub env: Vec<String>,
    /// Whether stdin stays open for writes
    pub process_mode: ProcessMode,
    /// Bytes written to stdin right after the spawn
    pub write_data: Bytes,
    /// Output routing
    pub channel_mode: ChannelMode,
    /// File connected to stdin, empty for none
    pub standard_input_file: String,
    /// Run below normal scheduling priority
    pub below_normal_priority: bool,
    /// Pre-quoted argument string used verbatim where the platform supports it
    pub native_arguments: String,
    /// Run at low priority
    pub low_priority: bool,
    /// Detach the process from the controlling terminal
    pub unix_terminal_disabled: bool,
}

impl StartProcess {
    /// Create a start request with default settings
    pub fn new(token: Token, command: impl Into<String>, arguments: Vec<String>) -> Self {
        Self {
            token,
            command: command.into(),
            arguments,
            ..Self::default()
        }
    }
}

/// Final report for one process
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ProcessFinished {
    /// Process token
    pub token: Token,
    /// Error that ended the process, `UnknownError` if none
    pub error: ProcessErrorKind,
    /// Human readable error
    pub error_string: String,
    /// Stdout not yet forwarded
    pub std_out: Bytes,
    /// Stderr not yet forwarded
    pub std_err: Bytes,
    /// How the process ended
    pub exit_status: ExitStatus,
    /// Exit code reported by the OS
    pub exit_code: i32,
}

/// A decoded packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    /// Helper should terminate every process and exit
    Shutdown {
        /// Unused by the helper, always zero when sent by the host
        token: Token,
    },
    /// Spawn a process
    StartProcess(StartProcess),
    /// Write to a running process's stdin
    WriteIntoProcess {
        /// Process token
        token: Token,
        /// Bytes to write
        data: Bytes,
    },
    /// Kill a process
    StopProcess {
        /// Process token
        token: Token,
    },
    /// A process hit an error
    ProcessError {
        /// Process token
        token: Token,
        /// Error category
        error: ProcessErrorKind,
        /// Human readable error
        error_string: String,
    },
    /// A process was spawned
    ProcessStarted {
        /// Process token
        token: Token,
        /// OS process id
        pid: i64,
    },
    /// Stdout bytes
    ReadyReadStandardOutput {
        /// Process token
        token: Token,
        /// Output chunk
        data: Bytes,
    },
    /// Stderr bytes
    ReadyReadStandardError {
        /// Process token
        token: Token,
        /// Output chunk
        data: Bytes,
    },
    /// A process ended
    ProcessFinished(ProcessFinished),
}

impl Packet {
    /// Token of the process this packet belongs to
    pub fn token(&self) -> Token {
        match self {
            Self::Shutdown { token }
            | Self::WriteIntoProcess { token, .. }
            | Self::StopProcess { token }
            | Self::ProcessError { token, .. }
            | Self::ProcessStarted { token, .. }
            | Self::ReadyReadStandardOutput { token, .. }
            | Self::ReadyReadStandardError { token, .. } => *token,
            Self::StartProcess(p) => p.token,
            Self::ProcessFinished(p) => p.token,
        }
    }

    /// Discriminant written in the frame header
    pub fn packet_type(&self) -> PacketType {
        match self {
            Self::Shutdown { .. } => PacketType::Shutdown,
            Self::StartProcess(_) => PacketType::StartProcess,
            Self::WriteIntoProcess { .. } => PacketType::WriteIntoProcess,
            Self::StopProcess { .. } => PacketType::StopProcess,
            Self::ProcessError { .. } => PacketType::ProcessError,
            Self::ProcessStarted { .. } => PacketType::ProcessStarted,
            Self::ReadyReadStandardOutput { .. } => PacketType::ReadyReadStandardOutput,
            Self::ReadyReadStandardError { .. } => PacketType::ReadyReadStandardError,
            Self::ProcessFinished(_) => PacketType::ProcessFinished,
        }
    }

    /// Encode into a complete frame, size header included
    ///
    /// The encoded frame must not exceed [`MAX_PACKET_SIZE`].
    pub fn serialize(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(SIZE_FIELD_LEN + HEADER_SIZE + 32);
        buf.put_u32_le(0);
        buf.put_u8(self.packet_type() as u8);
        buf.put_u64_le(self.token().as_u64());
        self.encode_payload(&mut buf);

        let size = buf.len() - SIZE_FIELD_LEN;
        debug_assert!(
            size <= MAX_PACKET_SIZE,
            "packet of {size} bytes exceeds the frame limit"
        );
        let size = size as u32;
        buf[..SIZE_FIELD_LEN].copy_from_slice(&size.to_le_bytes());
        buf.freeze()
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::Shutdown { .. } | Self::StopProcess { .. } => {}
            Self::StartProcess(p) => {
                put_string(buf, &p.command);
                put_string_list(buf, &p.arguments);
                put_string(buf, &p.working_dir);
                put_string_list(buf, &p.env);
                buf.put_u8(p.process_mode as u8);
                put_bytes(buf, &p.write_data);
                buf.put_u8(p.channel_mode as u8);
                put_string(buf, &p.standard_input_file);
                buf.put_u8(p.below_normal_priority as u8);
                put_string(buf, &p.native_arguments);
                buf.put_u8(p.low_priority as u8);
                buf.put_u8(p.unix_terminal_disabled as u8);
            }
            Self::WriteIntoProcess { data, .. }
            | Self::ReadyReadStandardOutput { data, .. }
            | Self::ReadyReadStandardError { data, .. } => put_bytes(buf, data),
            Self::ProcessError {
                error,
                error_string,
                ..
            } => {
                buf.put_u8(*error as u8);
                put_string(buf, error_string);
            }
            Self::ProcessStarted { pid, .. } => buf.put_i64_le(*pid),
            Self::ProcessFinished(p) => {
                buf.put_u8(p.error as u8);
                put_string(buf, &p.error_string);
                put_bytes(buf, &p.std_out);
                put_bytes(buf, &p.std_err);
                buf.put_u8(p.exit_status as u8);
                buf.put_i32_le(p.exit_code);
            }
        }
    }

    /// Decode the payload of a frame whose header has already been read
    pub fn deserialize(packet_type: PacketType, token: Token, payload: Bytes) -> Result<Self> {
        let mut d = Decoder { buf: payload };
        let packet = match packet_type {
            PacketType::Shutdown => Self::Shutdown { token },
            PacketType::StartProcess => Self::StartProcess(StartProcess {
                token,
                command: d.string("command")?,
                arguments: d.string_list("arguments")?,
                working_dir: d.string("working_dir")?,
                env: d.string_list("env")?,
                process_mode: d.process_mode()?,
                write_data: d.bytes("write_data")?,
                channel_mode: d.channel_mode()?,
                standard_input_file: d.string("standard_input_file")?,
                below_normal_priority: d.bool("below_normal_priority")?,
                native_arguments: d.string("native_arguments")?,
                low_priority: d.bool("low_priority")?,
                unix_terminal_disabled: d.bool("unix_terminal_disabled")?,
            }),
            PacketType::WriteIntoProcess => Self::WriteIntoProcess {
                token,
                data: d.bytes("data")?,
            },
            PacketType::StopProcess => Self::StopProcess { token },
            PacketType::ProcessError => Self::ProcessError {
                token,
                error: d.error_kind()?,
                error_string: d.string("error_string")?,
            },
            PacketType::ProcessStarted => Self::ProcessStarted {
                token,
                pid: d.i64("pid")?,
            },
            PacketType::ReadyReadStandardOutput => Self::ReadyReadStandardOutput {
                token,
                data: d.bytes("data")?,
            },
            PacketType::ReadyReadStandardError => Self::ReadyReadStandardError {
                token,
                data: d.bytes("data")?,
            },
            PacketType::ProcessFinished => Self::ProcessFinished(ProcessFinished {
                token,
                error: d.error_kind()?,
                error_string: d.string("error_string")?,
                std_out: d.bytes("std_out")?,
                std_err: d.bytes("std_err")?,
                exit_status: d.exit_status()?,
                exit_code: d.i32("exit_code")?,
            }),
        };
        d.finish()?;
        Ok(packet)
    }
}

fn put_bytes(buf: &mut BytesMut, data: &[u8]) {
    debug_assert!(data.len() <= MAX_PACKET_SIZE);
    buf.put_u32_le(data.len() as u32);
    buf.put_slice(data);
}

fn put_string(buf: &mut BytesMut, s: &str) {
    put_bytes(buf, s.as_bytes());
}

fn put_string_list(buf: &mut BytesMut, list: &[String]) {
    buf.put_u32_le(list.len() as u32);
    for s in list {
        put_string(buf, s);
    }
}

struct Decoder {
    buf: Bytes,
}

impl Decoder {
    fn ensure(&self, field: &'static str, needed: usize) -> Result<()> {
        if self.buf.remaining() < needed {
            return Err(ProtocolError::truncated(field, needed, self.buf.remaining()));
        }
        Ok(())
    }

    fn u8(&mut self, field: &'static str) -> Result<u8> {
        self.ensure(field, 1)?;
        Ok(self.buf.get_u8())
    }

    fn u32(&mut self, field: &'static str) -> Result<u32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_u32_le())
    }

    fn i32(&mut self, field: &'static str) -> Result<i32> {
        self.ensure(field, 4)?;
        Ok(self.buf.get_i32_le())
    }

    fn i64(&mut self, field: &'static str) -> Result<i64> {
        self.ensure(field, 8)?;
        Ok(self.buf.get_i64_le())
    }

    fn bool(&mut self, field: &'static str) -> Result<bool> {
        match self.u8(field)? {
            0 => Ok(false),
            1 => Ok(true),
            v => Err(ProtocolError::invalid_value(field, v)),
        }
    }

    fn bytes(&mut self, field: &'static str) -> Result<Bytes> {
        let len = self.u32(field)? as usize;
        self.ensure(field, len)?;
        Ok(self.buf.split_to(len))
    }

    fn string(&mut self, field: &'static str) -> Result<String> {
        let raw = self.bytes(field)?;
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8(field))
    }

    fn string_list(&mut self, field: &'static str) -> Result<Vec<String>> {
        let count = self.u32(field)? as usize;
        // Each entry needs at least its length prefix.
        let mut list = Vec::with_capacity(count.min(self.buf.remaining() / 4));
        for _ in 0..count {
            list.push(self.string(field)?);
        }
        Ok(list)
    }

    fn error_kind(&mut self) -> Result<ProcessErrorKind> {
        let v = self.u8("error")?;
        ProcessErrorKind::from_u8(v).ok_or(ProtocolError::invalid_value("error", v))
    }

    fn exit_status(&mut self) -> Result<ExitStatus> {
        let v = self.u8("exit_status")?;
        ExitStatus::from_u8(v).ok_or(ProtocolError::invalid_value("exit_status", v))
    }

    fn channel_mode(&mut self) -> Result<ChannelMode> {
        let v = self.u8("channel_mode")?;
        ChannelMode::from_u8(v).ok_or(ProtocolError::invalid_value("channel_mode", v))
    }

    fn process_mode(&mut self) -> Result<ProcessMode> {
        let v = self.u8("process_mode")?;
        ProcessMode::from_u8(v).ok_or(ProtocolError::invalid_value("process_mode", v))
    }

    fn finish(self) -> Result<()> {
        match self.buf.remaining() {
            0 => Ok(()),
            n => Err(ProtocolError::TrailingBytes(n)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn payload_of(frame: &Bytes) -> Bytes {
        frame.slice(SIZE_FIELD_LEN + HEADER_SIZE..)
    }

    fn roundtrip(packet: &Packet) -> Packet {
        let frame = packet.serialize();
        Packet::deserialize(packet.packet_type(), packet.token(), payload_of(&frame))
            .expect("decode")
    }

    #[test]
    fn test_header_layout() {
        let frame = Packet::ProcessStarted {
            token: Token::new(0x0102),
            pid: 77,
        }
        .serialize();

        assert_eq!(frame.len(), SIZE_FIELD_LEN + HEADER_SIZE + 8);
        assert_eq!(&frame[..4], &((HEADER_SIZE + 8) as u32).to_le_bytes());
        assert_eq!(frame[4], PacketType::ProcessStarted as u8);
        assert_eq!(&frame[5..13], &0x0102u64.to_le_bytes());
        assert_eq!(&frame[13..], &77i64.to_le_bytes());
    }

    #[test]
    fn test_shutdown_has_empty_payload() {
        let frame = Packet::Shutdown {
            token: Token::new(0),
        }
        .serialize();
        assert_eq!(frame.len(), SIZE_FIELD_LEN + HEADER_SIZE);
    }

    #[test]
    fn test_start_process_roundtrip() {
        let packet = Packet::StartProcess(StartProcess {
            token: Token::new(9),
            command: "/bin/sh".into(),
            arguments: vec!["-c".into(), "echo hi".into()],
            working_dir: "/tmp".into(),
            env: vec!["A=1".into(), "B=".into()],
            process_mode: ProcessMode::Writer,
            write_data: Bytes::from_static(b"input"),
            channel_mode: ChannelMode::MergedChannels,
            standard_input_file: String::new(),
            below_normal_priority: true,
            native_arguments: "\"quoted arg\"".into(),
            low_priority: false,
            unix_terminal_disabled: true,
        });
        assert_eq!(roundtrip(&packet), packet);
    }

    #[rstest]
    #[case(Bytes::new())]
    #[case(Bytes::from_static(b"x"))]
    #[case(Bytes::from(vec![0u8; 4096]))]
    fn test_byte_payloads(#[case] data: Bytes) {
        let token = Token::new(3);
        for packet in [
            Packet::WriteIntoProcess {
                token,
                data: data.clone(),
            },
            Packet::ReadyReadStandardOutput {
                token,
                data: data.clone(),
            },
            Packet::ReadyReadStandardError {
                token,
                data: data.clone(),
            },
        ] {
            assert_eq!(roundtrip(&packet), packet);
        }
    }

    #[test]
    fn test_finished_roundtrip() {
        let packet = Packet::ProcessFinished(ProcessFinished {
            token: Token::new(5),
            error: ProcessErrorKind::Crashed,
            error_string: "killed".into(),
            std_out: Bytes::new(),
            std_err: Bytes::from_static(b"boom\n"),
            exit_status: ExitStatus::CrashExit,
            exit_code: -1,
        });
        assert_eq!(roundtrip(&packet), packet);
    }

    #[test]
    fn test_truncated_payload() {
        let err = Packet::deserialize(
            PacketType::ProcessStarted,
            Token::new(1),
            Bytes::from_static(&[1, 2, 3]),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::truncated("pid", 8, 3));
    }

    #[test]
    fn test_byte_length_past_end() {
        let mut payload = BytesMut::new();
        payload.put_u32_le(100);
        payload.put_slice(b"short");
        let err = Packet::deserialize(
            PacketType::ReadyReadStandardOutput,
            Token::new(1),
            payload.freeze(),
        )
        .unwrap_err();
        assert!(matches!(err, ProtocolError::Truncated { needed: 100, .. }));
    }

    #[test]
    fn test_invalid_enum_byte() {
        let mut payload = BytesMut::new();
        payload.put_u8(42);
        put_string(&mut payload, "");
        let err = Packet::deserialize(PacketType::ProcessError, Token::new(1), payload.freeze())
            .unwrap_err();
        assert_eq!(err, ProtocolError::invalid_value("error", 42));
    }

    #[test]
    fn test_trailing_bytes_rejected() {
        let err = Packet::deserialize(
            PacketType::StopProcess,
            Token::new(1),
            Bytes::from_static(b"??"),
        )
        .unwrap_err();
        assert_eq!(err, ProtocolError::TrailingBytes(2));
    }

    #[test]
    fn test_host_request_direction() {
        assert!(PacketType::StartProcess.is_host_request());
        assert!(PacketType::Shutdown.is_host_request());
        assert!(!PacketType::ProcessFinished.is_host_request());
        assert!(!PacketType::ReadyReadStandardError.is_host_request());
    }
}
