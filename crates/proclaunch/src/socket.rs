//! Registry of handle pairs and the outbound request queue

use crate::dispatcher::Command;
use crate::error::{LauncherError, Result};
use crate::handle::{CallerHandle, CallerShared, LauncherHandle};
use bytes::Bytes;
use parking_lot::Mutex;
use proclaunch_protocol::{ProcessMode, Token};
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, mpsc};
use std::thread::{self, ThreadId};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, trace};

/// Shared endpoint between callers and the dispatcher thread
///
/// Callers register tokens here and queue encoded requests. The dispatcher
/// owns the actual connection and drains the queue on its own thread.
pub struct LauncherSocket {
    handles: Mutex<HashMap<Token, Arc<LauncherHandle>>>,
    requests: Mutex<Vec<Bytes>>,
    ready: AtomicBool,
    failed: AtomicBool,
    commands: UnboundedSender<Command>,
    dispatcher_thread: OnceLock<ThreadId>,
}

impl fmt::Debug for LauncherSocket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LauncherSocket")
            .field("handles", &self.handles.lock().len())
            .field("pending_requests", &self.requests.lock().len())
            .field("ready", &self.is_ready())
            .finish_non_exhaustive()
    }
}

impl LauncherSocket {
    pub(crate) fn new(commands: UnboundedSender<Command>) -> Self {
        Self {
            handles: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            ready: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            commands,
            dispatcher_thread: OnceLock::new(),
        }
    }

    /// Create the handle pair for `token`
    ///
    /// The returned [`CallerHandle`] belongs to the calling thread. If the
    /// connection has already failed the handle starts in the socket-error
    /// state and any `start` reports `FailedToStart`.
    pub fn register(self: &Arc<Self>, token: Token, mode: ProcessMode) -> Result<CallerHandle> {
        self.ensure_not_dispatcher("register")?;

        let mut handles = self.handles.lock();
        if handles.contains_key(&token) {
            return Err(LauncherError::DuplicateToken(token));
        }

        let launcher = Arc::new(LauncherHandle::new(
            token,
            self.failed.load(Ordering::Acquire),
        ));
        let caller = Arc::new(CallerShared::new(
            token,
            Arc::downgrade(self),
            Arc::clone(&launcher),
        ));
        launcher.set_caller(Some(Arc::clone(&caller)));
        handles.insert(token, launcher);
        debug!(%token, ?mode, "registered process handle");

        Ok(CallerHandle::new(caller, mode))
    }

    /// Remove the handle pair for `token`
    ///
    /// Both back-pointers are cleared so later packets for the token are
    /// ignored. Unknown tokens are a no-op.
    pub fn unregister(&self, token: Token) -> Result<()> {
        self.ensure_not_dispatcher("unregister")?;

        let Some(launcher) = self.handles.lock().remove(&token) else {
            return Ok(());
        };
        if let Some(caller) = launcher.take_caller() {
            caller.clear_launcher();
        }
        debug!(%token, "unregistered process handle");
        Ok(())
    }

    /// Queue an encoded request for the helper
    ///
    /// Requests made while the connection is down are dropped.
    pub fn send(&self, data: Bytes) {
        if !self.is_ready() {
            debug!(len = data.len(), "launcher not ready, dropping request");
            return;
        }
        let first = {
            let mut requests = self.requests.lock();
            requests.push(data);
            requests.len() == 1
        };
        if first && self.commands.send(Command::Flush).is_err() {
            debug!("dispatcher is gone, request will not be written");
        }
    }

    /// Whether the helper is connected
    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Ask the dispatcher to send Shutdown to the helper and wait for it
    ///
    /// Blocks until the packet is written or the flush timeout passed.
    pub fn shutdown(&self) -> Result<()> {
        self.ensure_not_dispatcher("shutdown")?;
        let (reply, done) = mpsc::channel();
        self.post(Command::Shutdown { reply })?;
        done.recv().map_err(|_| LauncherError::DispatcherGone)
    }

    /// Number of registered tokens
    pub fn handle_count(&self) -> usize {
        self.handles.lock().len()
    }

    pub(crate) fn handle_for(&self, token: Token) -> Option<Arc<LauncherHandle>> {
        self.handles.lock().get(&token).cloned()
    }

    pub(crate) fn snapshot(&self) -> Vec<Arc<LauncherHandle>> {
        self.handles.lock().values().cloned().collect()
    }

    pub(crate) fn take_requests(&self) -> Vec<Bytes> {
        std::mem::take(&mut *self.requests.lock())
    }

    pub(crate) fn post(&self, command: Command) -> Result<()> {
        self.commands
            .send(command)
            .map_err(|_| LauncherError::DispatcherGone)
    }

    pub(crate) fn set_dispatcher_thread(&self, id: ThreadId) {
        let _ = self.dispatcher_thread.set(id);
    }

    /// The connection came up
    pub(crate) fn mark_ready(&self) {
        self.failed.store(false, Ordering::Release);
        self.ready.store(true, Ordering::Release);
        for handle in self.snapshot() {
            handle.handle_socket_ready();
        }
    }

    /// The connection was closed on purpose; handles are not notified
    pub(crate) fn mark_closed(&self) {
        self.ready.store(false, Ordering::Release);
        self.failed.store(true, Ordering::Release);
        self.requests.lock().clear();
    }

    /// The connection failed; returns false if it had already failed
    pub(crate) fn mark_failed(&self, message: &str) -> bool {
        self.ready.store(false, Ordering::Release);
        if self.failed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.requests.lock().clear();
        for handle in self.snapshot() {
            trace!(token = %handle.token(), "failing handle after socket error");
            handle.handle_socket_error(message);
        }
        true
    }

    pub(crate) fn ensure_not_dispatcher(&self, operation: &'static str) -> Result<()> {
        if self.dispatcher_thread.get() == Some(&thread::current().id()) {
            return Err(LauncherError::WrongThread(operation));
        }
        Ok(())
    }
}
