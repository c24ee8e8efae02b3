//! Connection to the host and the table of supervised processes

use crate::process::ManagedProcess;
use anyhow::{Context, Result};
use bytes::Bytes;
use proclaunch_protocol::{Packet, PacketParser, ProcessErrorKind, StartProcess, Token};
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::path::Path;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::UnixStream;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tracing::{debug, error, info, warn};

const READ_CHUNK: usize = 64 * 1024;

/// Serve the host until it sends Shutdown or disconnects
pub async fn run(server_path: &Path) -> Result<()> {
    let stream = UnixStream::connect(server_path)
        .await
        .with_context(|| format!("failed to connect to {}", server_path.display()))?;
    info!(socket = %server_path.display(), "connected to host");

    let (mut reader, writer) = stream.into_split();
    let (outbound, packets) = mpsc::unbounded_channel();
    tokio::spawn(write_packets(writer, packets));

    let (exited, mut exits) = mpsc::unbounded_channel();
    let mut launcher = Launcher::new(outbound, exited);
    let mut parser = PacketParser::new();

    let result = loop {
        tokio::select! {
            read = read_more(&mut reader, &mut parser) => match read {
                Ok(0) => {
                    info!("host disconnected");
                    break Ok(());
                }
                Ok(_) => match launcher.handle_buffered(&mut parser) {
                    Ok(ControlFlow::Continue(())) => {}
                    Ok(ControlFlow::Break(())) => break Ok(()),
                    Err(e) => {
                        error!(error = %e, "invalid data from host");
                        break Err(e.into());
                    }
                },
                Err(e) => {
                    warn!(error = %e, "failed to read from host");
                    break Ok(());
                }
            },
            Some(token) = exits.recv() => launcher.remove(token),
        }
    };

    launcher.kill_all();
    result
}

async fn read_more(
    reader: &mut tokio::net::unix::OwnedReadHalf,
    parser: &mut PacketParser,
) -> std::io::Result<usize> {
    let buf = parser.buffer_mut();
    buf.reserve(READ_CHUNK);
    reader.read_buf(buf).await
}

async fn write_packets(mut writer: OwnedWriteHalf, mut packets: UnboundedReceiver<Packet>) {
    while let Some(packet) = packets.recv().await {
        if let Err(e) = writer.write_all(&packet.serialize()).await {
            warn!(error = %e, "failed to write to host");
            break;
        }
    }
}

struct Launcher {
    processes: HashMap<Token, ManagedProcess>,
    outbound: UnboundedSender<Packet>,
    exited: UnboundedSender<Token>,
}

impl Launcher {
    fn new(outbound: UnboundedSender<Packet>, exited: UnboundedSender<Token>) -> Self {
        Self {
            processes: HashMap::new(),
            outbound,
            exited,
        }
    }

    fn handle_buffered(
        &mut self,
        parser: &mut PacketParser,
    ) -> proclaunch_protocol::Result<ControlFlow<()>> {
        while let Some(raw) = parser.parse()? {
            if self.handle(raw.decode()?).is_break() {
                return Ok(ControlFlow::Break(()));
            }
        }
        Ok(ControlFlow::Continue(()))
    }

    fn handle(&mut self, packet: Packet) -> ControlFlow<()> {
        match packet {
            Packet::Shutdown { .. } => {
                info!("shutdown requested");
                return ControlFlow::Break(());
            }
            Packet::StartProcess(start) => self.start(start),
            Packet::WriteIntoProcess { token, data } => self.write(token, data),
            Packet::StopProcess { token } => match self.processes.get_mut(&token) {
                Some(process) => process.stop(),
                None => debug!(%token, "stop requested for unknown process"),
            },
            other => warn!(
                token = %other.token(),
                packet_type = ?other.packet_type(),
                "ignoring packet meant for the host"
            ),
        }
        ControlFlow::Continue(())
    }

    fn start(&mut self, start: StartProcess) {
        let token = start.token;
        if self.processes.contains_key(&token) {
            warn!(%token, "start requested for a token that is already running");
            self.send(Packet::ProcessError {
                token,
                error: ProcessErrorKind::FailedToStart,
                error_string: format!("Token {token} is already in use"),
            });
            return;
        }

        let program = start.command.clone();
        match ManagedProcess::spawn(start, self.outbound.clone(), self.exited.clone()) {
            Ok(process) => {
                info!(%token, %program, pid = process.pid(), "process started");
                self.processes.insert(token, process);
            }
            Err(e) => {
                warn!(%token, %program, error = %e, "failed to start process");
                self.send(Packet::ProcessError {
                    token,
                    error: ProcessErrorKind::FailedToStart,
                    error_string: e.to_string(),
                });
            }
        }
    }

    fn write(&self, token: Token, data: Bytes) {
        match self.processes.get(&token) {
            Some(process) => process.write(data),
            None => debug!(%token, len = data.len(), "dropping write for unknown process"),
        }
    }

    fn remove(&mut self, token: Token) {
        if self.processes.remove(&token).is_some() {
            debug!(%token, "process removed");
        }
    }

    fn send(&self, packet: Packet) {
        if self.outbound.send(packet).is_err() {
            debug!("host writer is gone");
        }
    }

    fn kill_all(&mut self) {
        for (token, process) in self.processes.drain() {
            debug!(%token, "killing process on shutdown");
            process.kill();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proclaunch_protocol::{ExitStatus, ProcessFinished};
    use tokio::net::UnixListener;
    use tokio::time::{Duration, timeout};

    async fn next_packet(stream: &mut UnixStream, parser: &mut PacketParser) -> Packet {
        loop {
            if let Some(raw) = parser.parse().unwrap() {
                return raw.decode().unwrap();
            }
            let n = stream.read_buf(parser.buffer_mut()).await.unwrap();
            assert_ne!(n, 0, "helper closed the connection");
        }
    }

    async fn collect_until_finished(
        stream: &mut UnixStream,
        parser: &mut PacketParser,
    ) -> (Vec<Packet>, ProcessFinished) {
        let mut packets = Vec::new();
        loop {
            match next_packet(stream, parser).await {
                Packet::ProcessFinished(finished) => return (packets, finished),
                other => packets.push(other),
            }
        }
    }

    fn stdout_of(packets: &[Packet]) -> Vec<u8> {
        packets
            .iter()
            .filter_map(|packet| match packet {
                Packet::ReadyReadStandardOutput { data, .. } => Some(data.to_vec()),
                _ => None,
            })
            .flatten()
            .collect()
    }

    async fn connect() -> (tempfile::TempDir, UnixStream, tokio::task::JoinHandle<Result<()>>) {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("host.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let helper = tokio::spawn(async move { run(&path).await });
        let (stream, _) = listener.accept().await.unwrap();
        (dir, stream, helper)
    }

    #[tokio::test]
    async fn test_echo_is_started_streamed_and_finished() {
        let (_dir, mut stream, helper) = connect().await;
        let token = Token::new(11);
        let start = Packet::StartProcess(StartProcess::new(token, "echo", vec!["hi".into()]));
        stream.write_all(&start.serialize()).await.unwrap();

        let mut parser = PacketParser::new();
        let (packets, finished) = timeout(
            Duration::from_secs(10),
            collect_until_finished(&mut stream, &mut parser),
        )
        .await
        .unwrap();

        assert!(matches!(packets[0], Packet::ProcessStarted { token: t, pid } if t == token && pid > 0));
        assert_eq!(stdout_of(&packets), b"hi\n");
        assert_eq!(finished.exit_code, 0);
        assert_eq!(finished.exit_status, ExitStatus::NormalExit);
        assert_eq!(finished.error, ProcessErrorKind::UnknownError);

        let shutdown = Packet::Shutdown { token: Token::default() };
        stream.write_all(&shutdown.serialize()).await.unwrap();
        timeout(Duration::from_secs(5), helper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_reports_failed_to_start_only() {
        let (_dir, mut stream, helper) = connect().await;
        let token = Token::new(12);
        let start = Packet::StartProcess(StartProcess::new(
            token,
            "/nonexistent/definitely-not-here",
            vec![],
        ));
        stream.write_all(&start.serialize()).await.unwrap();

        let mut parser = PacketParser::new();
        let packet = timeout(Duration::from_secs(5), next_packet(&mut stream, &mut parser))
            .await
            .unwrap();
        assert!(matches!(
            packet,
            Packet::ProcessError { token: t, error: ProcessErrorKind::FailedToStart, .. } if t == token
        ));

        drop(stream);
        timeout(Duration::from_secs(5), helper)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_stop_reports_crash() {
        let (_dir, mut stream, _helper) = connect().await;
        let token = Token::new(13);
        let start = Packet::StartProcess(StartProcess::new(token, "sleep", vec!["30".into()]));
        stream.write_all(&start.serialize()).await.unwrap();

        let mut parser = PacketParser::new();
        let started = timeout(Duration::from_secs(5), next_packet(&mut stream, &mut parser))
            .await
            .unwrap();
        assert!(matches!(started, Packet::ProcessStarted { .. }));

        stream
            .write_all(&Packet::StopProcess { token }.serialize())
            .await
            .unwrap();
        let (_, finished) = timeout(
            Duration::from_secs(5),
            collect_until_finished(&mut stream, &mut parser),
        )
        .await
        .unwrap();
        assert_eq!(finished.error, ProcessErrorKind::Crashed);
        assert_eq!(finished.exit_status, ExitStatus::CrashExit);
        assert_eq!(finished.exit_code, -1);
    }

    #[tokio::test]
    async fn test_writer_mode_forwards_stdin() {
        let (_dir, mut stream, _helper) = connect().await;
        let token = Token::new(14);
        let mut start = StartProcess::new(token, "head", vec!["-n".into(), "1".into()]);
        start.process_mode = proclaunch_protocol::ProcessMode::Writer;
        stream
            .write_all(&Packet::StartProcess(start).serialize())
            .await
            .unwrap();

        let mut parser = PacketParser::new();
        let started = timeout(Duration::from_secs(5), next_packet(&mut stream, &mut parser))
            .await
            .unwrap();
        assert!(matches!(started, Packet::ProcessStarted { .. }));

        let write = Packet::WriteIntoProcess {
            token,
            data: Bytes::from_static(b"line\n"),
        };
        stream.write_all(&write.serialize()).await.unwrap();

        let (packets, finished) = timeout(
            Duration::from_secs(10),
            collect_until_finished(&mut stream, &mut parser),
        )
        .await
        .unwrap();
        assert_eq!(stdout_of(&packets), b"line\n");
        assert_eq!(finished.exit_code, 0);
    }
}
