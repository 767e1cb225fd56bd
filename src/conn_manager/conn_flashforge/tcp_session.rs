use tracing::{debug, error, info, trace, warn};

use std::{
    io,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Weak,
    },
};
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::TcpStream,
    sync::RwLock,
    time::Instant,
};

use crate::{
    config::{
        printer_config::{PrinterConfigFlashForge, TcpSessionOptions},
        printer_id::PrinterId,
    },
    error::{Error, FramingFault, Result},
};

use super::{
    gcode_commands::{is_login_accepted, ReplyTerminator, CMD_LOGIN, CMD_LOGOUT},
    keep_alive::{KeepAliveHandle, KeepAliveState},
};

pub(super) type StreamGuard<'a> = tokio::sync::MutexGuard<'a, Option<TcpStream>>;

/// Whether a command may open a new socket when the old one is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(super) enum Reconnect {
    Lazily,
    Never,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticated,
}

/// One TCP control connection to one printer.
///
/// Cheap to clone, all clones drive the same socket. Every write goes through
/// [`TcpSession::execute`], which holds the socket lock for the whole
/// write-then-read exchange, so foreground commands and keep-alive pings never
/// interleave.
#[derive(Clone)]
pub struct TcpSession {
    inner: Arc<Inner>,
}

struct Inner {
    id: PrinterId,
    printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>,
    /// The command lock. `None` until the first command, and again after any fault.
    stream: tokio::sync::Mutex<Option<TcpStream>>,
    state: parking_lot::RwLock<ConnectionState>,
    /// Serializes login handshakes, separate from the command lock since a login spans several commands.
    auth_lock: tokio::sync::Mutex<()>,
    keep_alive: parking_lot::Mutex<Option<KeepAliveHandle>>,
    keep_alive_state: parking_lot::Mutex<KeepAliveState>,
    keep_alive_starts: AtomicU64,
}

pub(super) struct WeakTcpSession(Weak<Inner>);

impl WeakTcpSession {
    pub(super) fn upgrade(&self) -> Option<TcpSession> {
        self.0.upgrade().map(|inner| TcpSession { inner })
    }
}

/// new
impl TcpSession {
    pub fn new(id: PrinterId, printer_cfg: Arc<RwLock<PrinterConfigFlashForge>>) -> Self {
        let opts = TcpSessionOptions::default();
        Self {
            inner: Arc::new(Inner {
                id,
                printer_cfg,
                stream: tokio::sync::Mutex::new(None),
                state: parking_lot::RwLock::new(ConnectionState::Disconnected),
                auth_lock: tokio::sync::Mutex::new(()),
                keep_alive: parking_lot::Mutex::new(None),
                keep_alive_state: parking_lot::Mutex::new(KeepAliveState::new(
                    opts.keep_alive_floor,
                    opts.keep_alive_step,
                )),
                keep_alive_starts: AtomicU64::new(0),
            }),
        }
    }

    pub fn id(&self) -> &PrinterId {
        &self.inner.id
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.read()
    }

    fn set_state(&self, state: ConnectionState) {
        *self.inner.state.write() = state;
    }

    async fn options(&self) -> (String, TcpSessionOptions) {
        let cfg = self.inner.printer_cfg.read().await;
        (cfg.tcp_addr(), cfg.session)
    }

    fn downgrade(&self) -> WeakTcpSession {
        WeakTcpSession(Arc::downgrade(&self.inner))
    }
}

/// keep-alive
impl TcpSession {
    pub fn keep_alive_state(&self) -> KeepAliveState {
        *self.inner.keep_alive_state.lock()
    }

    pub(super) fn update_keep_alive<T>(&self, f: impl FnOnce(&mut KeepAliveState) -> T) -> T {
        f(&mut self.inner.keep_alive_state.lock())
    }

    pub fn keep_alive_active(&self) -> bool {
        self.inner
            .keep_alive
            .lock()
            .as_ref()
            .map(|h| h.is_running())
            .unwrap_or(false)
    }

    /// How many keep-alive loops this session has spawned so far.
    pub fn keep_alive_starts(&self) -> u64 {
        self.inner.keep_alive_starts.load(Ordering::SeqCst)
    }

    fn start_keep_alive(&self, opts: &TcpSessionOptions) {
        let mut slot = self.inner.keep_alive.lock();
        if slot.as_ref().map(|h| h.is_running()).unwrap_or(false) {
            trace!("keep-alive already running");
            return;
        }

        self.inner
            .keep_alive_state
            .lock()
            .set_timing(opts.keep_alive_floor, opts.keep_alive_step);

        *slot = Some(KeepAliveHandle::spawn(self.downgrade()));
        self.inner.keep_alive_starts.fetch_add(1, Ordering::SeqCst);
    }

    fn stop_keep_alive(&self) -> Option<tokio::task::JoinHandle<()>> {
        self.inner.keep_alive.lock().take().map(|h| h.cancel())
    }
}

/// connect, execute
impl TcpSession {
    async fn connect(&self, addr: &str, opts: &TcpSessionOptions) -> Result<TcpStream> {
        self.set_state(ConnectionState::Connecting);
        debug!("connecting to {}", addr);

        let res = match tokio::time::timeout(opts.connect_timeout, TcpStream::connect(addr)).await {
            Ok(Ok(stream)) => Ok(stream),
            Ok(Err(e)) => Err(Error::Transport(e)),
            Err(_) => Err(Error::Transport(io::Error::new(
                io::ErrorKind::TimedOut,
                format!("connect to {} timed out after {:?}", addr, opts.connect_timeout),
            ))),
        };

        match res {
            Ok(stream) => {
                if let Err(e) = stream.set_nodelay(true) {
                    debug!("set_nodelay failed: {}", e);
                }
                Ok(stream)
            }
            Err(e) => {
                warn!("connect to {} failed: {}", addr, e);
                self.set_state(ConnectionState::Disconnected);
                Err(e)
            }
        }
    }

    /// Sends one line and returns the raw telegram.
    ///
    /// Connects lazily. On any transport or framing fault the socket is dropped,
    /// the keep-alive loop is cancelled and the session falls back to
    /// `Disconnected`. Nothing is retried here.
    pub async fn execute(&self, line: &str) -> Result<String> {
        let guard = self.lock_stream().await;
        self.execute_locked(guard, line, Reconnect::Lazily).await
    }

    /// Waits for the command lock.
    pub(super) async fn lock_stream(&self) -> StreamGuard<'_> {
        self.inner.stream.lock().await
    }

    /// Runs one exchange on an already held command lock.
    ///
    /// With [`Reconnect::Never`] a dropped socket is an error instead of a new connection.
    pub(super) async fn execute_locked(
        &self,
        mut guard: StreamGuard<'_>,
        line: &str,
        reconnect: Reconnect,
    ) -> Result<String> {
        let (addr, opts) = self.options().await;

        if guard.is_none() {
            if reconnect == Reconnect::Never {
                trace!("not connected, skipping {:?}", line);
                return Err(Error::Transport(io::Error::from(io::ErrorKind::NotConnected)));
            }
            *guard = Some(self.connect(&addr, &opts).await?);
        }
        let stream = guard
            .as_mut()
            .ok_or_else(|| Error::Transport(io::Error::from(io::ErrorKind::NotConnected)))?;

        debug!("sending {:?}", line);
        match exchange(stream, line, &opts).await {
            Ok(reply) => {
                trace!("reply to {:?}: {:?}", line, reply);
                Ok(reply)
            }
            Err(e) => {
                warn!("{:?} failed, dropping socket: {}", line, e);
                // torn down before the lock is released
                *guard = None;
                self.set_state(ConnectionState::Disconnected);
                let _ = self.stop_keep_alive();
                drop(guard);
                Err(e)
            }
        }
    }

    /// [`TcpSession::execute`], re-authenticating and replaying once after a transport fault.
    pub async fn send_command(&self, line: &str) -> Result<String> {
        match self.execute(line).await {
            Err(e) if e.is_transport_fault() => {
                info!("reconnecting after fault on {:?}: {}", line, e);
                self.authenticate().await?;
                self.execute(line).await
            }
            res => res,
        }
    }
}

/// Writes `line` and reads until the reply terminator.
///
/// The first read waits up to the whole deadline. Once bytes have arrived, a
/// silence longer than `idle_grace` means the device has nothing more to send.
async fn exchange(stream: &mut TcpStream, line: &str, opts: &TcpSessionOptions) -> Result<String> {
    let terminator = ReplyTerminator::for_command(line);

    stream
        .write_all(format!("{}\n", line).as_bytes())
        .await
        .map_err(Error::Transport)?;
    stream.flush().await.map_err(Error::Transport)?;

    let deadline = Instant::now() + opts.read_timeout;
    let mut buf: Vec<u8> = Vec::with_capacity(1024);
    let mut chunk = [0u8; 4096];

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            return Err(Error::Framing(FramingFault::Deadline(opts.read_timeout)));
        }
        let wait = if buf.is_empty() {
            remaining
        } else {
            remaining.min(opts.idle_grace)
        };

        let n = match tokio::time::timeout(wait, stream.read(&mut chunk)).await {
            Ok(Ok(0)) => {
                return Err(Error::Transport(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "device closed the connection",
                )))
            }
            Ok(Ok(n)) => n,
            Ok(Err(e)) => return Err(Error::Transport(e)),
            Err(_) if wait < remaining => return Err(Error::Framing(FramingFault::NoTerminator)),
            Err(_) => return Err(Error::Framing(FramingFault::Deadline(opts.read_timeout))),
        };

        buf.extend_from_slice(&chunk[..n]);
        let text = String::from_utf8_lossy(&buf);
        if terminator.is_complete(&text) {
            return Ok(text.into_owned());
        }
    }
}

/// login, logout
impl TcpSession {
    /// Logs in, retrying with a logout and a linearly growing pause.
    ///
    /// The logout clears a stale server-side session left by an earlier
    /// client that vanished without logging out.
    pub async fn authenticate(&self) -> Result<()> {
        let _auth = self.inner.auth_lock.lock().await;
        let (addr, opts) = self.options().await;

        for attempt in 1..=opts.login_attempts {
            if attempt > 1 {
                if let Err(e) = self.execute(CMD_LOGOUT).await {
                    debug!("logout before retry failed: {}", e);
                }
                tokio::time::sleep(opts.login_retry_step * (attempt - 1)).await;
            }

            debug!("login attempt {}/{} to {}", attempt, opts.login_attempts, addr);
            match self.execute(CMD_LOGIN).await {
                Ok(reply) if is_login_accepted(&reply) => {
                    info!("logged in to {} ({})", self.inner.id, addr);
                    self.set_state(ConnectionState::Authenticated);
                    self.start_keep_alive(&opts);
                    return Ok(());
                }
                Ok(reply) => warn!("login refused: {:?}", reply.trim()),
                Err(e) => warn!("login attempt {} failed: {}", attempt, e),
            }
        }

        error!(
            "could not log in to {} after {} attempts",
            addr, opts.login_attempts
        );
        self.close().await;
        Err(Error::LoginFailed(opts.login_attempts))
    }

    async fn close(&self) {
        let _ = self.stop_keep_alive();
        let stream = self.inner.stream.lock().await.take();
        if let Some(mut stream) = stream {
            if let Err(e) = stream.shutdown().await {
                trace!("socket shutdown: {}", e);
            }
        }
        self.set_state(ConnectionState::Disconnected);
    }

    /// Stops keep-alive, logs out if logged in, closes the socket. Safe to call twice.
    pub async fn shutdown(&self) {
        if let Some(task) = self.stop_keep_alive() {
            if let Err(e) = task.await {
                debug!("keep-alive task ended abnormally: {}", e);
            }
        }

        if self.state() == ConnectionState::Authenticated {
            if let Err(e) = self.execute(CMD_LOGOUT).await {
                debug!("logout failed: {}", e);
            }
        }

        self.close().await;
        debug!("session {} shut down", self.inner.id);
    }
}
