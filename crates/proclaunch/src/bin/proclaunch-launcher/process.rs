//! One supervised child process

use bytes::{Bytes, BytesMut};
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use proclaunch_protocol::{
    ChannelMode, ExitStatus, Packet, ProcessErrorKind, ProcessFinished, ProcessMode,
    StartProcess, Token,
};
use std::future::pending;
use std::io;
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, ChildStdin, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::{debug, trace, warn};

const READ_CHUNK: usize = 16 * 1024;
const STOPPED_MESSAGE: &str = "Process was stopped.";

/// A running child and the channels into its supervisor task
#[derive(Debug)]
pub struct ManagedProcess {
    token: Token,
    pid: u32,
    own_group: bool,
    stdin: Option<UnboundedSender<Bytes>>,
    stop: Option<oneshot::Sender<()>>,
}

impl ManagedProcess {
    /// Spawn the child, report it started and begin streaming its output
    pub fn spawn(
        start: StartProcess,
        outbound: UnboundedSender<Packet>,
        exited: UnboundedSender<Token>,
    ) -> io::Result<Self> {
        let token = start.token;
        let mut child = build_command(&start)?.spawn()?;
        let pid = child.id().unwrap_or_default();
        send_to_host(
            &outbound,
            Packet::ProcessStarted {
                token,
                pid: i64::from(pid),
            },
        );

        let stdin = child.stdin.take().and_then(|stdin| {
            let keep_open = start.process_mode == ProcessMode::Writer;
            let (tx, rx) = mpsc::unbounded_channel();
            tokio::spawn(feed_stdin(
                token,
                stdin,
                start.write_data.clone(),
                keep_open.then_some(rx),
            ));
            keep_open.then_some(tx)
        });

        let (stop, stop_requested) = oneshot::channel();
        let supervisor = Supervisor {
            token,
            pid,
            own_group: start.unix_terminal_disabled,
            merged: start.channel_mode == ChannelMode::MergedChannels,
            outbound,
            exited,
        };
        tokio::spawn(supervisor.run(child, stop_requested));

        Ok(Self {
            token,
            pid,
            own_group: start.unix_terminal_disabled,
            stdin,
            stop: Some(stop),
        })
    }

    /// OS process id
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Queue bytes for the child's stdin
    pub fn write(&self, data: Bytes) {
        match &self.stdin {
            Some(stdin) if stdin.send(data).is_ok() => {}
            _ => debug!(token = %self.token, "stdin is closed, dropping write"),
        }
    }

    /// Kill the child and report it crashed
    pub fn stop(&mut self) {
        if let Some(stop) = self.stop.take()
            && stop.send(()).is_err()
        {
            debug!(token = %self.token, "process already finished");
        }
    }

    /// Kill the child without reporting anything
    pub fn kill(self) {
        signal_child(self.pid, self.own_group);
    }
}

fn build_command(start: &StartProcess) -> io::Result<Command> {
    let mut command = Command::new(&start.command);
    command.args(&start.arguments);
    if !start.native_arguments.is_empty() {
        command.args(start.native_arguments.split_whitespace());
    }
    if !start.working_dir.is_empty() {
        command.current_dir(&start.working_dir);
    }
    if !start.env.is_empty() {
        command.env_clear();
        for entry in &start.env {
            let (key, value) = entry.split_once('=').unwrap_or((entry.as_str(), ""));
            command.env(key, value);
        }
    }

    let stdin = if !start.standard_input_file.is_empty() {
        Stdio::from(std::fs::File::open(&start.standard_input_file)?)
    } else if start.process_mode == ProcessMode::Writer || !start.write_data.is_empty() {
        Stdio::piped()
    } else {
        Stdio::null()
    };
    // Forwarded channels are still piped; the host writes them out.
    command
        .stdin(stdin)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    if start.unix_terminal_disabled {
        command.process_group(0);
    }
    if start.low_priority || start.below_normal_priority {
        trace!(token = %start.token, "priority hints are not applied on this platform");
    }
    Ok(command)
}

async fn feed_stdin(
    token: Token,
    mut stdin: ChildStdin,
    initial: Bytes,
    more: Option<UnboundedReceiver<Bytes>>,
) {
    if !initial.is_empty()
        && let Err(e) = stdin.write_all(&initial).await
    {
        debug!(%token, error = %e, "failed to write to stdin");
        return;
    }
    let Some(mut more) = more else {
        return;
    };
    while let Some(data) = more.recv().await {
        if let Err(e) = stdin.write_all(&data).await {
            debug!(%token, error = %e, "failed to write to stdin");
            return;
        }
    }
}

struct Supervisor {
    token: Token,
    pid: u32,
    own_group: bool,
    merged: bool,
    outbound: UnboundedSender<Packet>,
    exited: UnboundedSender<Token>,
}

impl Supervisor {
    async fn run(self, mut child: Child, mut stop: oneshot::Receiver<()>) {
        let mut stdout = child.stdout.take();
        let mut stderr = child.stderr.take();
        let mut status = None;

        while stdout.is_some() || stderr.is_some() || status.is_none() {
            tokio::select! {
                chunk = read_chunk(stdout.as_mut()) => match chunk {
                    Some(data) => self.send(Packet::ReadyReadStandardOutput { token: self.token, data }),
                    None => stdout = None,
                },
                chunk = read_chunk(stderr.as_mut()) => match chunk {
                    Some(data) if self.merged => {
                        self.send(Packet::ReadyReadStandardOutput { token: self.token, data });
                    }
                    Some(data) => self.send(Packet::ReadyReadStandardError { token: self.token, data }),
                    None => stderr = None,
                },
                result = child.wait(), if status.is_none() => status = Some(result),
                _ = &mut stop => {
                    self.stop(&mut child, status.is_some()).await;
                    return;
                }
            }
        }

        let finished = match status {
            Some(status) => finished_packet(self.token, status),
            None => return,
        };
        self.send(Packet::ProcessFinished(finished));
        self.exit();
    }

    async fn stop(&self, child: &mut Child, reaped: bool) {
        debug!(token = %self.token, pid = self.pid, "stopping process");
        if !reaped {
            signal_child(self.pid, self.own_group);
        }
        if let Err(e) = child.wait().await {
            warn!(token = %self.token, error = %e, "failed to reap stopped process");
        }
        self.send(Packet::ProcessFinished(ProcessFinished {
            token: self.token,
            error: ProcessErrorKind::Crashed,
            error_string: STOPPED_MESSAGE.to_string(),
            std_out: Bytes::new(),
            std_err: Bytes::new(),
            exit_status: ExitStatus::CrashExit,
            exit_code: -1,
        }));
        self.exit();
    }

    fn send(&self, packet: Packet) {
        send_to_host(&self.outbound, packet);
    }

    fn exit(&self) {
        if self.exited.send(self.token).is_err() {
            trace!(token = %self.token, "process table is gone");
        }
    }
}

fn send_to_host(outbound: &UnboundedSender<Packet>, packet: Packet) {
    let token = packet.token();
    if outbound.send(packet).is_err() {
        trace!(%token, "host writer is gone");
    }
}

async fn read_chunk<R: AsyncRead + Unpin>(reader: Option<&mut R>) -> Option<Bytes> {
    let Some(reader) = reader else {
        return pending().await;
    };
    let mut buf = BytesMut::with_capacity(READ_CHUNK);
    match reader.read_buf(&mut buf).await {
        Ok(0) | Err(_) => None,
        Ok(_) => Some(buf.freeze()),
    }
}

fn signal_child(pid: u32, own_group: bool) {
    let Ok(raw) = i32::try_from(pid) else {
        return;
    };
    let pid = Pid::from_raw(raw);
    let result = if own_group {
        killpg(pid, Signal::SIGKILL)
    } else {
        kill(pid, Signal::SIGKILL)
    };
    if let Err(e) = result {
        debug!(%pid, error = %e, "failed to kill process");
    }
}

fn finished_packet(token: Token, status: io::Result<std::process::ExitStatus>) -> ProcessFinished {
    match status {
        Ok(status) => match status.code() {
            Some(exit_code) => ProcessFinished {
                token,
                exit_code,
                exit_status: ExitStatus::NormalExit,
                ..ProcessFinished::default()
            },
            None => ProcessFinished {
                token,
                error: ProcessErrorKind::Crashed,
                error_string: match status.signal() {
                    Some(signal) => format!("Process crashed with signal {signal}."),
                    None => "Process crashed.".to_string(),
                },
                exit_status: ExitStatus::CrashExit,
                exit_code: status.signal().unwrap_or(-1),
                ..ProcessFinished::default()
            },
        },
        Err(e) => ProcessFinished {
            token,
            error: ProcessErrorKind::UnknownError,
            error_string: e.to_string(),
            exit_status: ExitStatus::CrashExit,
            exit_code: -1,
            ..ProcessFinished::default()
        },
    }
}
