//! Dispatcher thread owning the helper connection
//!
//! A single named thread runs a current-thread tokio runtime. It owns the
//! listener, the connected stream and the helper child, and is the only place
//! that reads or writes the socket. Other threads talk to it through
//! [`Command`]s.

use crate::config::LauncherConfig;
use crate::error::{LauncherError, Result};
use crate::handle::ProcessState;
use crate::socket::LauncherSocket;
use bytes::{Bytes, BytesMut};
use nix::sys::signal::{Signal, killpg};
use nix::unistd::Pid;
use proclaunch_protocol::{Packet, PacketParser, ProtocolError, Token};
use std::future::pending;
use std::io;
use std::ops::ControlFlow;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{UnixListener, UnixStream};
use tokio::process::{Child, ChildStderr};
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::{debug, error, info, trace, warn};

const THREAD_NAME: &str = "proclaunch-dispatcher";
const READ_CHUNK: usize = 64 * 1024;

/// Requests handled on the dispatcher thread
#[derive(Debug)]
pub(crate) enum Command {
    /// Bind the listener and spawn the helper
    Start { reply: mpsc::Sender<Result<()>> },
    /// Install an already connected stream
    Attach {
        stream: std::os::unix::net::UnixStream,
        reply: mpsc::Sender<Result<()>>,
    },
    /// Write the pending requests
    Flush,
    /// Send Shutdown to the helper and close the connection
    Shutdown { reply: mpsc::Sender<()> },
    /// Tear everything down and exit the thread
    Stop { reply: mpsc::Sender<()> },
}

/// Spawn the dispatcher thread
pub(crate) fn spawn(
    socket: Arc<LauncherSocket>,
    commands: UnboundedReceiver<Command>,
    config: LauncherConfig,
    instance: u64,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(THREAD_NAME.to_string())
        .spawn(move || {
            socket.set_dispatcher_thread(thread::current().id());
            let runtime = match tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()
            {
                Ok(runtime) => runtime,
                Err(e) => {
                    error!(error = %e, "failed to build dispatcher runtime");
                    return;
                }
            };
            runtime.block_on(Dispatcher::new(socket, config, instance).run(commands));
            debug!("dispatcher thread exiting");
        })
}

struct Dispatcher {
    socket: Arc<LauncherSocket>,
    config: LauncherConfig,
    instance: u64,
    listener: Option<UnixListener>,
    socket_path: Option<PathBuf>,
    reader: Option<OwnedReadHalf>,
    writer: Option<OwnedWriteHalf>,
    parser: PacketParser,
    child: Option<Child>,
}

impl Dispatcher {
    fn new(socket: Arc<LauncherSocket>, config: LauncherConfig, instance: u64) -> Self {
        Self {
            socket,
            config,
            instance,
            listener: None,
            socket_path: None,
            reader: None,
            writer: None,
            parser: PacketParser::new(),
            child: None,
        }
    }

    async fn run(mut self, mut commands: UnboundedReceiver<Command>) {
        loop {
            tokio::select! {
                command = commands.recv() => {
                    let Some(command) = command else {
                        self.stop().await;
                        break;
                    };
                    if self.handle_command(command).await.is_break() {
                        break;
                    }
                }
                accepted = accept(self.listener.as_ref()) => self.on_accept(accepted),
                read = read_some(self.reader.as_mut(), self.parser.buffer_mut()) => {
                    self.on_read(read);
                }
                status = wait_child(self.child.as_mut()) => self.on_child_exit(status),
            }
        }
    }

    async fn handle_command(&mut self, command: Command) -> ControlFlow<()> {
        match command {
            Command::Start { reply } => {
                let result = self.start();
                let _ = reply.send(result);
            }
            Command::Attach { stream, reply } => {
                let result = self.attach(stream);
                let _ = reply.send(result);
            }
            Command::Flush => self.flush().await,
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
            Command::Stop { reply } => {
                self.stop().await;
                let _ = reply.send(());
                return ControlFlow::Break(());
            }
        }
        ControlFlow::Continue(())
    }

    fn is_running(&self) -> bool {
        self.listener.is_some() || self.writer.is_some() || self.child.is_some()
    }

    fn start(&mut self) -> Result<()> {
        if self.is_running() {
            return Err(LauncherError::AlreadyRunning);
        }

        let path = self.config.socket_path(self.instance);
        remove_socket_file(&path);
        let listener = match UnixListener::bind(&path) {
            Ok(listener) => listener,
            Err(e) => {
                let err = LauncherError::listen(&path, e);
                self.fail(&err.to_string());
                return Err(err);
            }
        };
        self.socket_path = Some(path.clone());

        let launcher_path = &self.config.launcher_path;
        let mut command = tokio::process::Command::new(launcher_path);
        command
            .arg(&path)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .process_group(0)
            .kill_on_drop(true);

        match command.spawn() {
            Ok(mut child) => {
                info!(
                    pid = child.id(),
                    launcher = %launcher_path.display(),
                    socket = %path.display(),
                    "process launcher started"
                );
                if let Some(stderr) = child.stderr.take() {
                    tokio::spawn(forward_launcher_log(stderr));
                }
                self.listener = Some(listener);
                self.child = Some(child);
                Ok(())
            }
            Err(e) => {
                let err = LauncherError::spawn(launcher_path, e);
                drop(listener);
                self.remove_socket_file();
                self.fail(&err.to_string());
                Err(err)
            }
        }
    }

    fn attach(&mut self, stream: std::os::unix::net::UnixStream) -> Result<()> {
        if self.is_running() {
            return Err(LauncherError::AlreadyRunning);
        }
        stream.set_nonblocking(true)?;
        let stream = UnixStream::from_std(stream)?;
        debug!("attaching pre-connected launcher stream");
        self.install(stream);
        Ok(())
    }

    fn on_accept(&mut self, accepted: io::Result<UnixStream>) {
        // One helper per launcher.
        self.listener = None;
        match accepted {
            Ok(stream) => {
                debug!("process launcher connected");
                self.install(stream);
            }
            Err(e) => self.fail(&format!("Socket error: {e}")),
        }
    }

    fn install(&mut self, stream: UnixStream) {
        let (reader, writer) = stream.into_split();
        self.reader = Some(reader);
        self.writer = Some(writer);
        self.parser = PacketParser::new();
        self.socket.mark_ready();
    }

    fn on_read(&mut self, read: io::Result<usize>) {
        match read {
            Ok(0) => self.fail("Launcher socket closed unexpectedly."),
            Ok(n) => {
                trace!(bytes = n, buffered = self.parser.buffered(), "read from launcher");
                self.dispatch_buffered();
            }
            Err(e) => self.fail(&format!("Socket error: {e}")),
        }
    }

    fn dispatch_buffered(&mut self) {
        loop {
            let raw = match self.parser.parse() {
                Ok(Some(raw)) => raw,
                Ok(None) => return,
                Err(e) => return self.fail(&e.to_string()),
            };
            if raw.packet_type.is_host_request() {
                let err = ProtocolError::UnknownPacketType(raw.packet_type as u8);
                return self.fail(&err.to_string());
            }
            let Some(handle) = self.socket.handle_for(raw.token) else {
                trace!(token = %raw.token, packet_type = ?raw.packet_type, "no handle for packet");
                continue;
            };
            if let Err(e) = handle.handle_packet(raw.packet_type, raw.payload) {
                return self.fail(&e.to_string());
            }
        }
    }

    fn on_child_exit(&mut self, status: io::Result<ExitStatus>) {
        self.child = None;
        match status {
            Ok(status) => info!(%status, "process launcher exited"),
            Err(e) => warn!(error = %e, "failed to wait for process launcher"),
        }
        self.fail("Process launcher closed unexpectedly");
    }

    /// Drop the connection and fail every registered handle
    fn fail(&mut self, message: &str) {
        self.listener = None;
        self.reader = None;
        self.writer = None;
        self.parser = PacketParser::new();
        if self.socket.mark_failed(message) {
            warn!(error = message, "launcher connection failed");
        }
    }

    async fn flush(&mut self) {
        let requests = self.socket.take_requests();
        let Some(writer) = self.writer.as_mut() else {
            debug!(dropped = requests.len(), "no launcher connection, dropping requests");
            return;
        };
        if let Err(e) = write_all(writer, &requests).await {
            self.fail(&format!("Socket error: {e}"));
        }
    }

    async fn shutdown(&mut self) {
        self.listener = None;
        self.reader = None;
        if let Some(mut writer) = self.writer.take() {
            let packet = Packet::Shutdown {
                token: Token::default(),
            }
            .serialize();
            match timeout(self.config.shutdown_flush_timeout, writer.write_all(&packet)).await {
                Ok(Ok(())) => debug!("shutdown sent to process launcher"),
                Ok(Err(e)) => warn!(error = %e, "failed to send shutdown to process launcher"),
                Err(_) => warn!(
                    timeout = ?self.config.shutdown_flush_timeout,
                    "timed out sending shutdown to process launcher"
                ),
            }
        }
        self.socket.mark_closed();
    }

    async fn stop(&mut self) {
        self.listener = None;
        self.report_leaks();
        self.shutdown().await;

        if let Some(mut child) = self.child.take() {
            match timeout(self.config.stop_timeout, child.wait()).await {
                Ok(Ok(status)) => info!(%status, "process launcher exited"),
                Ok(Err(e)) => warn!(error = %e, "failed to wait for process launcher"),
                Err(_) => {
                    warn!(
                        timeout = ?self.config.stop_timeout,
                        "process launcher did not exit, killing its process group"
                    );
                    kill_group(&mut child).await;
                }
            }
        }
        self.remove_socket_file();
    }

    fn report_leaks(&self) {
        let handles = self.socket.snapshot();
        if handles.is_empty() {
            return;
        }
        warn!(
            count = handles.len(),
            "process launcher stopped with registered handles"
        );
        for handle in handles {
            match handle.caller() {
                Some(caller) if caller.state() != ProcessState::NotRunning => warn!(
                    token = %handle.token(),
                    program = %caller.program(),
                    arguments = ?caller.arguments(),
                    thread = caller.owner_thread(),
                    "leaked process handle"
                ),
                _ => warn!(token = %handle.token(), "leaked handle, not running process"),
            }
        }
    }

    fn remove_socket_file(&mut self) {
        if let Some(path) = self.socket_path.take() {
            remove_socket_file(&path);
        }
    }
}

async fn accept(listener: Option<&UnixListener>) -> io::Result<UnixStream> {
    match listener {
        Some(listener) => listener.accept().await.map(|(stream, _)| stream),
        None => pending().await,
    }
}

async fn read_some(reader: Option<&mut OwnedReadHalf>, buf: &mut BytesMut) -> io::Result<usize> {
    match reader {
        Some(reader) => {
            buf.reserve(READ_CHUNK);
            reader.read_buf(buf).await
        }
        None => pending().await,
    }
}

async fn wait_child(child: Option<&mut Child>) -> io::Result<ExitStatus> {
    match child {
        Some(child) => child.wait().await,
        None => pending().await,
    }
}

async fn write_all(writer: &mut OwnedWriteHalf, requests: &[Bytes]) -> io::Result<()> {
    for request in requests {
        writer.write_all(request).await?;
    }
    writer.flush().await
}

async fn kill_group(child: &mut Child) {
    if let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok())
        && let Err(e) = killpg(Pid::from_raw(pid), Signal::SIGKILL)
    {
        warn!(pid, error = %e, "failed to kill process launcher group");
    }
    if let Err(e) = child.wait().await {
        warn!(error = %e, "failed to reap process launcher");
    }
}

/// Forward the helper's stderr into this process's log
async fn forward_launcher_log(stderr: ChildStderr) {
    let mut lines = BufReader::new(stderr).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "proclaunch::launcher", "[launcher] {line}"),
            Ok(None) => break,
            Err(e) => {
                debug!(error = %e, "process launcher log closed");
                break;
            }
        }
    }
}

fn remove_socket_file(path: &std::path::Path) {
    match std::fs::remove_file(path) {
        Ok(()) => trace!(path = %path.display(), "removed socket file"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => debug!(path = %path.display(), error = %e, "failed to remove socket file"),
    }
}
