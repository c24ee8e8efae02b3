//! Wire protocol for the proclaunch out-of-process launcher
//!
//! The host library and its bundled helper binary exchange length-prefixed
//! binary frames over one local socket. This crate holds both sides of that
//! contract and nothing else.
//!
//! # Type Organization
//!
//! - **Packets**: [`packet`] - the [`Packet`] sum type and its payload encoding
//! - **Framing**: [`parser`] - incremental reassembly of frames from a byte stream
//! - **Process enums**: [`types`] - error kinds, exit status, channel and process modes
//! - **Tokens**: [`token`] - per-process correlation ids
//! - **Error types**: [`error`] - framing and decoding errors
//!
//! # Design Principles
//!
//! - **Zero I/O**: the parser is fed bytes, it never reads them itself
//! - **Private format**: both ends always come from the same build, so there
//!   is no version negotiation

#![deny(unsafe_code)]
#![warn(missing_docs)]
//!
//! # Usage
//!
//! ```
//! use proclaunch_protocol::{Packet, PacketParser, Token};
//!
//! let frame = Packet::ProcessStarted { token: Token::new(7), pid: 4242 }.serialize();
//!
//! let mut parser = PacketParser::new();
//! parser.feed(&frame);
//! let raw = parser.parse().unwrap().expect("one full frame");
//! assert_eq!(raw.token, Token::new(7));
//! assert_eq!(
//!     raw.decode().unwrap(),
//!     Packet::ProcessStarted { token: Token::new(7), pid: 4242 }
//! );
//! ```

pub mod error;
pub mod packet;
pub mod parser;
pub mod token;
pub mod types;

pub use error::{ProtocolError, Result};
pub use packet::{
    HEADER_SIZE, MAX_PACKET_SIZE, Packet, PacketType, ProcessFinished, SIZE_FIELD_LEN, StartProcess,
};
pub use parser::{PacketParser, RawPacket};
pub use token::Token;
pub use types::{ChannelMode, ExitStatus, ProcessErrorKind, ProcessMode};
