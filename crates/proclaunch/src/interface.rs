//! Lifecycle of the helper process and its dispatcher thread

use crate::config::LauncherConfig;
use crate::dispatcher::{self, Command};
use crate::error::{LauncherError, Result};
use crate::handle::CallerHandle;
use crate::socket::LauncherSocket;
use parking_lot::Mutex;
use proclaunch_protocol::{ProcessMode, Token};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::JoinHandle;
use tokio::sync::mpsc::unbounded_channel;
use tracing::{debug, info, warn};

static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

/// Owns one helper process, its connection and the dispatcher thread
///
/// # Examples
///
/// ```no_run
/// use proclaunch::{LauncherConfig, LauncherInterface, ProcessMode, Token};
/// use std::time::Duration;
///
/// # fn main() -> proclaunch::Result<()> {
/// let launcher = LauncherInterface::new(LauncherConfig::from_env())?;
/// launcher.start()?;
///
/// let mut process = launcher.register(Token::next(), ProcessMode::Reader)?;
/// process.start("echo", vec!["hi".into()], Vec::<u8>::new())?;
/// if process.wait_for_finished(Duration::from_secs(5)) {
///     println!("{}", String::from_utf8_lossy(&process.read_all_standard_output()));
/// }
///
/// drop(process);
/// launcher.stop()?;
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct LauncherInterface {
    socket: Arc<LauncherSocket>,
    thread: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
}

impl LauncherInterface {
    /// Create the socket and spawn the dispatcher thread
    ///
    /// Nothing is connected until [`start`](Self::start) or
    /// [`attach`](Self::attach) is called.
    pub fn new(config: LauncherConfig) -> Result<Self> {
        let (commands, receiver) = unbounded_channel();
        let socket = Arc::new(LauncherSocket::new(commands));
        let instance = NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed);
        let thread = dispatcher::spawn(Arc::clone(&socket), receiver, config, instance)?;

        Ok(Self {
            socket,
            thread: Mutex::new(Some(thread)),
            started: AtomicBool::new(false),
        })
    }

    /// Bind the socket and spawn the helper
    ///
    /// Returns once the helper is spawned; the connection is accepted in the
    /// background and held start requests go out as soon as it is up.
    pub fn start(&self) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.request(Command::Start { reply }, done)?;
        self.started.store(true, Ordering::Release);
        info!("process launcher interface started");
        Ok(())
    }

    /// Use an already connected stream instead of spawning the helper
    pub fn attach(&self, stream: UnixStream) -> Result<()> {
        let (reply, done) = mpsc::channel();
        self.request(Command::Attach { stream, reply }, done)?;
        self.started.store(true, Ordering::Release);
        Ok(())
    }

    fn request(&self, command: Command, done: mpsc::Receiver<Result<()>>) -> Result<()> {
        self.socket.ensure_not_dispatcher("LauncherInterface")?;
        self.socket.post(command)?;
        done.recv().map_err(|_| LauncherError::DispatcherGone)?
    }

    /// Shut the helper down and join the dispatcher thread
    ///
    /// Safe to call more than once. Also called on drop.
    pub fn stop(&self) -> Result<()> {
        self.socket.ensure_not_dispatcher("stop")?;
        let Some(thread) = self.thread.lock().take() else {
            return Ok(());
        };

        let (reply, done) = mpsc::channel();
        if self.socket.post(Command::Stop { reply }).is_ok() && done.recv().is_err() {
            debug!("dispatcher exited before acknowledging stop");
        }
        self.started.store(false, Ordering::Release);
        thread.join().map_err(|_| LauncherError::DispatcherGone)?;
        info!("process launcher interface stopped");
        Ok(())
    }

    /// Whether `start` or `attach` succeeded and `stop` has not run
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Whether the helper is connected
    pub fn is_ready(&self) -> bool {
        self.socket.is_ready()
    }

    /// The shared socket
    pub fn socket(&self) -> &Arc<LauncherSocket> {
        &self.socket
    }

    /// Register a process handle, see [`LauncherSocket::register`]
    pub fn register(&self, token: Token, mode: ProcessMode) -> Result<CallerHandle> {
        self.socket.register(token, mode)
    }

    /// Unregister a process handle, see [`LauncherSocket::unregister`]
    pub fn unregister(&self, token: Token) -> Result<()> {
        self.socket.unregister(token)
    }
}

impl Drop for LauncherInterface {
    fn drop(&mut self) {
        if let Err(e) = self.stop() {
            warn!(error = %e, "failed to stop process launcher");
        }
    }
}
