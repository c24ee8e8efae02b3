//! Scripted stand-in for the helper process
//!
//! Holds the far end of a socket pair whose near end is attached to a
//! [`LauncherInterface`], so tests can see exactly which requests the host
//! sends and feed it any packet sequence, including broken ones.

use proclaunch::{LauncherConfig, LauncherInterface, Packet, Token};
use proclaunch_protocol::{PacketParser, StartProcess};
use std::io::{Read, Write};
use std::os::unix::net::UnixStream;
use std::time::Duration;

const READ_TIMEOUT: Duration = Duration::from_secs(5);

/// The helper side of an attached connection
pub struct FakeLauncher {
    stream: UnixStream,
    parser: PacketParser,
}

impl FakeLauncher {
    /// Wrap the helper end of a socket pair
    pub fn new(stream: UnixStream) -> Self {
        stream
            .set_read_timeout(Some(READ_TIMEOUT))
            .expect("set read timeout");
        Self {
            stream,
            parser: PacketParser::new(),
        }
    }

    /// Send one packet to the host
    pub fn send(&mut self, packet: Packet) {
        self.send_raw(&packet.serialize());
    }

    /// Send arbitrary bytes to the host
    pub fn send_raw(&mut self, bytes: &[u8]) {
        self.stream.write_all(bytes).expect("write to host");
    }

    /// Next packet from the host, panicking after the read timeout
    pub fn recv(&mut self) -> Packet {
        loop {
            if let Some(raw) = self.parser.parse().expect("valid frame from host") {
                return raw.decode().expect("decodable packet from host");
            }
            let mut chunk = [0u8; 4096];
            let n = self.stream.read(&mut chunk).expect("read from host");
            assert_ne!(n, 0, "host closed the connection");
            self.parser.feed(&chunk[..n]);
        }
    }

    /// Next packet, which must be a StartProcess
    pub fn expect_start(&mut self) -> StartProcess {
        match self.recv() {
            Packet::StartProcess(start) => start,
            other => panic!("expected StartProcess, got {other:?}"),
        }
    }

    /// Report `token` as started
    pub fn started(&mut self, token: Token, pid: i64) {
        self.send(Packet::ProcessStarted { token, pid });
    }

    /// Drop the connection
    pub fn disconnect(self) {
        drop(self);
    }
}

/// A launcher attached to a fresh fake helper
pub fn attached() -> (LauncherInterface, FakeLauncher) {
    let launcher = LauncherInterface::new(LauncherConfig::default()).expect("launcher");
    let (host, helper) = UnixStream::pair().expect("socket pair");
    launcher.attach(host).expect("attach");
    (launcher, FakeLauncher::new(helper))
}
