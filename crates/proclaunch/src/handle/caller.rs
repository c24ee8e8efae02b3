//! Owner-side half of a handle pair
//!
//! [`CallerHandle`] mirrors a child-process API. It lives on the thread that
//! registered it (it is `!Send`) and only changes its exposed state while
//! replaying queued records during a flush, so callbacks always run on the
//! owner thread. The parts the dispatcher thread needs to reach live in
//! [`CallerShared`], which is shared behind an `Arc`.

use super::{LauncherHandle, ProcessEvent, ProcessState, WaitOutcome};
use crate::error::{LauncherError, Result};
use crate::signal::{SignalQueue, SignalRecord, SignalType};
use crate::socket::LauncherSocket;
use bytes::Bytes;
use parking_lot::Mutex;
use proclaunch_protocol::{
    ChannelMode, ExitStatus, Packet, ProcessErrorKind, ProcessMode, StartProcess, Token,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::io::{self, Write};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tracing::{debug, trace, warn};

const CANCELED_BEFORE_START: &str = "Process was canceled before it was started.";

/// Exit code reported when a process failed to start
const FAILED_TO_START_EXIT_CODE: i32 = 255;

/// Largest stdin payload carried by one write packet
const WRITE_CHUNK: usize = 1024 * 1024;

/// State of a caller handle reachable from any thread
pub(crate) struct CallerShared {
    token: Token,
    state: AtomicU8,
    inner: Mutex<CallerInner>,
    flush_requested: Notify,
    socket: Weak<LauncherSocket>,
    owner_thread: String,
}

struct CallerInner {
    signals: SignalQueue,
    launcher: Option<Arc<LauncherHandle>>,
    program: String,
    arguments: Vec<String>,
    start_packet: Option<Bytes>,
}

impl fmt::Debug for CallerShared {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerShared")
            .field("token", &self.token)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

impl CallerShared {
    pub(crate) fn new(
        token: Token,
        socket: Weak<LauncherSocket>,
        launcher: Arc<LauncherHandle>,
    ) -> Self {
        Self {
            token,
            state: AtomicU8::new(ProcessState::NotRunning as u8),
            inner: Mutex::new(CallerInner {
                signals: SignalQueue::new(),
                launcher: Some(launcher),
                program: String::new(),
                arguments: Vec::new(),
                start_packet: None,
            }),
            flush_requested: Notify::new(),
            socket,
            owner_thread: thread::current()
                .name()
                .unwrap_or("<unnamed>")
                .to_string(),
        }
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    /// Name of the thread that registered the handle
    pub(crate) fn owner_thread(&self) -> &str {
        &self.owner_thread
    }

    pub(crate) fn state(&self) -> ProcessState {
        ProcessState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ProcessState) {
        self.state.store(state as u8, Ordering::Release);
    }

    fn swap_state(&self, state: ProcessState) -> ProcessState {
        ProcessState::from_u8(self.state.swap(state as u8, Ordering::AcqRel))
    }

    /// `Starting -> Running`, never resurrecting a canceled process
    fn mark_running(&self) -> bool {
        self.state
            .compare_exchange(
                ProcessState::Starting as u8,
                ProcessState::Running as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn program(&self) -> String {
        self.inner.lock().program.clone()
    }

    pub(crate) fn arguments(&self) -> Vec<String> {
        self.inner.lock().arguments.clone()
    }

    pub(crate) fn launcher(&self) -> Option<Arc<LauncherHandle>> {
        self.inner.lock().launcher.clone()
    }

    pub(crate) fn clear_launcher(&self) {
        self.inner.lock().launcher = None;
    }

    /// Queue a record; dispatcher thread only
    pub(crate) fn append_signal(&self, record: SignalRecord) {
        self.inner.lock().signals.push(record);
    }

    pub(crate) fn request_flush(&self) {
        self.flush_requested.notify_one();
    }

    pub(crate) fn should_flush_for(&self, signal: SignalType) -> bool {
        self.inner.lock().signals.should_flush_for(signal)
    }

    fn drain_for(&self, signal: SignalType) -> Vec<SignalRecord> {
        self.inner.lock().signals.drain_for(signal)
    }

    /// Send the held start request if the process is still starting
    pub(crate) fn start_if_needed(&self) {
        let mut inner = self.inner.lock();
        if self.state() == ProcessState::Starting {
            self.send_start(&mut inner);
        }
    }

    fn begin_start(&self, program: String, arguments: Vec<String>, packet: Bytes) {
        let mut inner = self.inner.lock();
        inner.program = program;
        inner.arguments = arguments;
        inner.start_packet = Some(packet);
        self.set_state(ProcessState::Starting);
        if self.socket_ready() {
            self.send_start(&mut inner);
        } else {
            debug!(token = %self.token, "launcher not ready, holding start request");
        }
    }

    fn send_start(&self, inner: &mut CallerInner) {
        if let Some(packet) = inner.start_packet.take() {
            trace!(token = %self.token, program = %inner.program, "sending start request");
            self.send(packet);
        }
    }

    fn send(&self, data: Bytes) {
        match self.socket.upgrade() {
            Some(socket) => socket.send(data),
            None => debug!(token = %self.token, "launcher socket is gone, dropping request"),
        }
    }

    fn socket_ready(&self) -> bool {
        self.socket.upgrade().is_some_and(|socket| socket.is_ready())
    }

    pub(crate) fn cancel(&self) {
        let previous = self.swap_state(ProcessState::NotRunning);
        let launcher = {
            let mut inner = self.inner.lock();
            match previous {
                ProcessState::NotRunning => {}
                ProcessState::Starting => {
                    if inner.start_packet.take().is_none() {
                        self.send(Packet::StopProcess { token: self.token }.serialize());
                    }
                    inner.signals.push(SignalRecord::Error {
                        kind: ProcessErrorKind::FailedToStart,
                        message: CANCELED_BEFORE_START.to_string(),
                    });
                }
                ProcessState::Running => {
                    self.send(Packet::StopProcess { token: self.token }.serialize());
                }
            }
            inner.launcher.clone()
        };
        debug!(token = %self.token, ?previous, "process canceled");

        if let Some(launcher) = launcher {
            launcher.set_canceled();
        }
        self.request_flush();
    }
}

/// Thread-safe view of a [`CallerHandle`]
///
/// Cloneable and `Send`, so another thread can watch the process or cancel a
/// wait the owner is blocked in.
#[derive(Debug, Clone)]
pub struct CallerRef {
    shared: Arc<CallerShared>,
}

impl CallerRef {
    /// Process token
    pub fn token(&self) -> Token {
        self.shared.token()
    }

    /// Program passed to `start`
    pub fn program(&self) -> String {
        self.shared.program()
    }

    /// Arguments passed to `start`
    pub fn arguments(&self) -> Vec<String> {
        self.shared.arguments()
    }

    /// Current process state
    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    /// Send the held start request if the launcher is now ready
    pub fn start_if_needed(&self) {
        self.shared.start_if_needed();
    }

    /// Cancel the process and wake any wait blocked on it
    ///
    /// The owner sees the outcome on its next flush.
    pub fn cancel(&self) {
        self.shared.cancel();
    }
}

/// Settings applied when the process is started
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessSettings {
    /// Working directory, the helper's own when unset
    pub working_directory: Option<PathBuf>,

    /// Full environment, inherited from the helper when unset
    pub environment: Option<BTreeMap<String, String>>,

    /// Output routing
    pub channel_mode: ChannelMode,

    /// File connected to stdin
    pub standard_input_file: Option<PathBuf>,

    /// Run below normal priority
    pub below_normal_priority: bool,

    /// Pre-quoted argument string
    pub native_arguments: Option<String>,

    /// Run at low priority
    pub low_priority: bool,

    /// Detach from the controlling terminal
    pub unix_terminal_disabled: bool,
}

type EventListener = Box<dyn FnMut(&ProcessEvent)>;

/// Child-process style handle owned by the registering thread
///
/// Created by [`LauncherSocket::register`](crate::LauncherSocket::register).
/// Dropping it unregisters its token.
pub struct CallerHandle {
    shared: Arc<CallerShared>,
    process_mode: ProcessMode,
    settings: ProcessSettings,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    process_id: i64,
    exit_code: i32,
    exit_status: ExitStatus,
    error: ProcessErrorKind,
    error_string: String,
    started: bool,
    listener: Option<EventListener>,
    // Owner-thread only.
    _not_send: PhantomData<*const ()>,
}

impl fmt::Debug for CallerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CallerHandle")
            .field("token", &self.shared.token())
            .field("state", &self.state())
            .field("process_id", &self.process_id)
            .field("exit_code", &self.exit_code)
            .field("error", &self.error)
            .finish_non_exhaustive()
    }
}

impl CallerHandle {
    pub(crate) fn new(shared: Arc<CallerShared>, process_mode: ProcessMode) -> Self {
        Self {
            shared,
            process_mode,
            settings: ProcessSettings::default(),
            stdout: Vec::new(),
            stderr: Vec::new(),
            process_id: 0,
            exit_code: 0,
            exit_status: ExitStatus::NormalExit,
            error: ProcessErrorKind::UnknownError,
            error_string: String::new(),
            started: false,
            listener: None,
            _not_send: PhantomData,
        }
    }

    /// Process token
    pub fn token(&self) -> Token {
        self.shared.token()
    }

    /// Mode the handle was registered with
    pub fn process_mode(&self) -> ProcessMode {
        self.process_mode
    }

    /// Thread-safe view of this handle
    pub fn shared(&self) -> CallerRef {
        CallerRef {
            shared: Arc::clone(&self.shared),
        }
    }

    /// Register the callback invoked for every replayed event
    pub fn on_event(&mut self, listener: impl FnMut(&ProcessEvent) + 'static) {
        self.listener = Some(Box::new(listener));
    }

    // Configuration

    /// Settings used by the next `start`
    pub fn settings(&self) -> &ProcessSettings {
        &self.settings
    }

    /// Replace all start settings
    pub fn set_settings(&mut self, settings: ProcessSettings) {
        self.settings = settings;
    }

    /// Set the working directory
    pub fn set_working_directory(&mut self, dir: impl Into<PathBuf>) {
        self.settings.working_directory = Some(dir.into());
    }

    /// Set the complete environment of the process
    pub fn set_environment<K, V>(&mut self, vars: impl IntoIterator<Item = (K, V)>)
    where
        K: Into<String>,
        V: Into<String>,
    {
        self.settings.environment = Some(
            vars.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        );
    }

    /// Set how stdout and stderr are routed
    pub fn set_process_channel_mode(&mut self, mode: ChannelMode) {
        self.settings.channel_mode = mode;
    }

    /// Connect stdin to a file
    pub fn set_standard_input_file(&mut self, path: impl Into<PathBuf>) {
        self.settings.standard_input_file = Some(path.into());
    }

    /// Run below normal priority
    pub fn set_below_normal_priority(&mut self) {
        self.settings.below_normal_priority = true;
    }

    /// Set a pre-quoted argument string
    pub fn set_native_arguments(&mut self, arguments: impl Into<String>) {
        self.settings.native_arguments = Some(arguments.into());
    }

    /// Run at low priority
    pub fn set_low_priority(&mut self) {
        self.settings.low_priority = true;
    }

    /// Detach the process from the controlling terminal
    pub fn set_unix_terminal_disabled(&mut self) {
        self.settings.unix_terminal_disabled = true;
    }

    // Process control

    /// Ask the launcher to start `program`
    ///
    /// If the launcher connection has failed the handle reports
    /// `FailedToStart` through its error state and listener and this still
    /// returns `Ok`. A handle starts at most once.
    pub fn start(
        &mut self,
        program: impl Into<String>,
        arguments: Vec<String>,
        write_data: impl Into<Bytes>,
    ) -> Result<()> {
        let program = program.into();
        let usable = self
            .shared
            .launcher()
            .is_some_and(|launcher| !launcher.is_socket_error());
        if !usable {
            warn!(token = %self.token(), %program, "process launcher is unavailable");
            self.error = ProcessErrorKind::FailedToStart;
            self.emit(ProcessEvent::ErrorOccurred(self.error));
            return Ok(());
        }

        if self.started || self.state() != ProcessState::NotRunning {
            warn!(
                token = %self.token(),
                %program,
                previous = %self.shared.program(),
                "start called on a handle that was already started"
            );
            return Err(LauncherError::AlreadyStarted);
        }
        self.started = true;

        let packet = self.start_packet(&program, &arguments, write_data.into());
        self.shared.begin_start(program, arguments, packet);
        Ok(())
    }

    fn start_packet(&self, program: &str, arguments: &[String], write_data: Bytes) -> Bytes {
        let settings = &self.settings;
        let path_string =
            |path: &Option<PathBuf>| path.as_ref().map(|p| p.to_string_lossy().into_owned());

        let mut packet = StartProcess::new(self.token(), program, arguments.to_vec());
        packet.working_dir = path_string(&settings.working_directory).unwrap_or_default();
        packet.env = settings
            .environment
            .iter()
            .flatten()
            .map(|(k, v)| format!("{k}={v}"))
            .collect();
        packet.process_mode = self.process_mode;
        packet.write_data = write_data;
        packet.channel_mode = settings.channel_mode;
        packet.standard_input_file =
            path_string(&settings.standard_input_file).unwrap_or_default();
        packet.below_normal_priority = settings.below_normal_priority;
        packet.native_arguments = settings.native_arguments.clone().unwrap_or_default();
        packet.low_priority = settings.low_priority;
        packet.unix_terminal_disabled = settings.unix_terminal_disabled;
        Packet::StartProcess(packet).serialize()
    }

    /// Write to the process's stdin
    pub fn write(&mut self, data: &[u8]) -> Result<usize> {
        if self.state() != ProcessState::Running {
            return Err(LauncherError::NotRunning);
        }
        for chunk in data.chunks(WRITE_CHUNK) {
            self.shared.send(
                Packet::WriteIntoProcess {
                    token: self.token(),
                    data: Bytes::copy_from_slice(chunk),
                }
                .serialize(),
            );
        }
        Ok(data.len())
    }

    /// Cancel the process
    ///
    /// A process that is still starting fails with `FailedToStart`. A running
    /// process is stopped by the helper. Any wait on this handle returns.
    pub fn cancel(&mut self) {
        self.shared.cancel();
        self.flush();
    }

    // Output and status

    /// Take the buffered stdout
    pub fn read_all_standard_output(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stdout)
    }

    /// Take the buffered stderr
    pub fn read_all_standard_error(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.stderr)
    }

    /// Current process state, readable without flushing
    pub fn state(&self) -> ProcessState {
        self.shared.state()
    }

    /// OS process id, 0 before the process started
    pub fn process_id(&self) -> i64 {
        self.process_id
    }

    /// Exit code of the finished process
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// How the process ended
    pub fn exit_status(&self) -> ExitStatus {
        self.exit_status
    }

    /// Last error
    pub fn error(&self) -> ProcessErrorKind {
        self.error
    }

    /// Last error message
    pub fn error_string(&self) -> &str {
        &self.error_string
    }

    /// Override the error message
    pub fn set_error_string(&mut self, message: impl Into<String>) {
        self.error_string = message.into();
    }

    /// Program passed to `start`
    pub fn program(&self) -> String {
        self.shared.program()
    }

    /// Arguments passed to `start`
    pub fn arguments(&self) -> Vec<String> {
        self.shared.arguments()
    }

    // Event delivery

    /// Replay everything queued
    pub fn flush(&mut self) -> Vec<SignalType> {
        self.flush_for(SignalType::NoSignal)
    }

    /// Replay the queued records a wait for `signal` consumes
    pub fn flush_for(&mut self, signal: SignalType) -> Vec<SignalType> {
        let records = self.shared.drain_for(signal);
        let flushed = records.iter().map(SignalRecord::signal_type).collect();
        for record in records {
            self.replay(record);
        }
        flushed
    }

    /// Replay pending events, returning whether there were any
    pub fn process_events(&mut self) -> bool {
        !self.flush().is_empty()
    }

    /// Resolves once the dispatcher has queued new records
    ///
    /// Follow it with [`process_events`](Self::process_events).
    pub async fn events_available(&self) {
        self.shared.flush_requested.notified().await;
    }

    // Blocking waits

    /// Block until the process started, failed or the timeout passed
    pub fn wait_for_started(&mut self, timeout: Duration) -> bool {
        self.wait_for_signal(timeout, SignalType::Started)
    }

    /// Block until output arrived, the process ended or the timeout passed
    pub fn wait_for_ready_read(&mut self, timeout: Duration) -> bool {
        self.wait_for_signal(timeout, SignalType::ReadyRead)
    }

    /// Block until the process finished, failed or the timeout passed
    pub fn wait_for_finished(&mut self, timeout: Duration) -> bool {
        self.wait_for_signal(timeout, SignalType::Finished)
    }

    fn can_wait_for(&self, signal: SignalType) -> bool {
        match signal {
            SignalType::Started => self.state() == ProcessState::Starting,
            SignalType::ReadyRead | SignalType::Finished => {
                self.state() != ProcessState::NotRunning
            }
            SignalType::NoSignal | SignalType::Error => false,
        }
    }

    fn wait_for_signal(&mut self, timeout: Duration, signal: SignalType) -> bool {
        if !self.can_wait_for(signal) {
            return false;
        }
        let Some(launcher) = self.shared.launcher() else {
            return false;
        };

        // A timeout too large for an Instant waits forever.
        let deadline = Instant::now().checked_add(timeout);
        while deadline.is_none_or(|deadline| Instant::now() < deadline) {
            match launcher.wait_for_signal(deadline, signal) {
                WaitOutcome::Ready => {}
                WaitOutcome::TimedOut => return false,
                WaitOutcome::Canceled => {
                    self.flush();
                    return false;
                }
            }

            let flushed = self.flush_for(signal);
            if flushed.contains(&SignalType::Error) {
                return false;
            }
            if flushed.contains(&signal) {
                return true;
            }
            if launcher.is_canceled() || flushed.contains(&SignalType::Finished) {
                return false;
            }
        }
        false
    }

    fn replay(&mut self, record: SignalRecord) {
        match record {
            SignalRecord::Error { kind, message } => {
                self.shared.set_state(ProcessState::NotRunning);
                self.error = kind;
                self.error_string = message;
                if kind == ProcessErrorKind::FailedToStart {
                    self.exit_code = FAILED_TO_START_EXIT_CODE;
                }
                self.emit(ProcessEvent::ErrorOccurred(kind));
            }
            SignalRecord::Started { pid } => {
                self.shared.mark_running();
                self.process_id = pid;
                self.emit(ProcessEvent::Started { pid });
            }
            SignalRecord::ReadyRead { stdout, stderr } => {
                let mode = self.settings.channel_mode;
                if mode.forwards_stdout() {
                    forward(io::stdout(), &stdout);
                } else {
                    self.stdout.extend_from_slice(&stdout);
                    if !self.stdout.is_empty() {
                        self.emit(ProcessEvent::ReadyReadStandardOutput);
                    }
                }
                if mode.forwards_stderr() {
                    forward(io::stderr(), &stderr);
                } else {
                    self.stderr.extend_from_slice(&stderr);
                    if !self.stderr.is_empty() {
                        self.emit(ProcessEvent::ReadyReadStandardError);
                    }
                }
            }
            SignalRecord::Finished {
                exit_code,
                exit_status,
            } => {
                self.shared.set_state(ProcessState::NotRunning);
                self.exit_code = exit_code;
                self.exit_status = exit_status;
                self.emit(ProcessEvent::Finished {
                    exit_code,
                    exit_status,
                });
            }
        }
    }

    fn emit(&mut self, event: ProcessEvent) {
        trace!(token = %self.token(), ?event, "process event");
        if let Some(listener) = self.listener.as_mut() {
            listener(&event);
        }
    }

    #[cfg(test)]
    pub(crate) fn detached(token: Token, process_mode: ProcessMode) -> (Self, Arc<LauncherHandle>) {
        let launcher = Arc::new(LauncherHandle::new(token, false));
        let shared = Arc::new(CallerShared::new(token, Weak::new(), Arc::clone(&launcher)));
        launcher.set_caller(Some(Arc::clone(&shared)));
        (Self::new(shared, process_mode), launcher)
    }
}

impl Drop for CallerHandle {
    fn drop(&mut self) {
        if let Some(socket) = self.shared.socket.upgrade()
            && let Err(e) = socket.unregister(self.token())
        {
            debug!(token = %self.token(), error = %e, "failed to unregister dropped handle");
        }
    }
}

fn forward(mut out: impl Write, data: &[u8]) {
    if data.is_empty() {
        return;
    }
    if let Err(e) = out.write_all(data).and_then(|()| out.flush()) {
        warn!(error = %e, "failed to forward process output");
    }
}
