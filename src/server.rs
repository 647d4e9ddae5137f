//! Listener lifecycle: bind, accept connections on a background thread, stop.

use std::fs::File;
use std::io::Write;
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::os::unix::io::{AsRawFd, FromRawFd};
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Receiver, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::select::{select, FdSet};
use nix::sys::time::TimeVal;
use nix::unistd::pipe;

use crate::access_log::AccessLog;
use crate::config::Config;
use crate::connection::{Connection, Shared};
use crate::error::Error;
use crate::registry::{ConnectionId, ConnectionRegistry};
use crate::response::Responder;
use crate::stats::ServerStats;

/// How often a paused listener checks whether it may accept again.
const ACCEPT_RETRY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Stopped,
    Starting,
    Running,
    Stopping,
}

/// Status changes published to subscribers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServerEvent {
    /// The listener is bound and accepting.
    Ready(SocketAddr),
    /// Accepting is paused for a while; not fatal.
    Waiting(String),
    /// The listener failed; the owner should stop the server.
    Failed(String),
    Stopped,
}

#[derive(Debug, Default)]
struct Observers {
    senders: Mutex<Vec<Sender<ServerEvent>>>,
}

impl Observers {
    fn subscribe(&self) -> Receiver<ServerEvent> {
        let (sender, receiver) = mpsc::channel();
        self.lock().push(sender);
        receiver
    }

    /// Send `event` to every subscriber, forgetting the ones that hung up.
    fn publish(&self, event: ServerEvent) {
        self.lock()
            .retain(|sender| sender.send(event.clone()).is_ok());
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Sender<ServerEvent>>> {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Handles to a started listener.
#[derive(Debug)]
struct Running {
    local_addr: SocketAddr,
    /// Writing a byte here tells the accept thread to exit.
    wake: File,
    accept_thread: JoinHandle<()>,
}

/// An embeddable file-sharing server.
#[derive(Debug)]
pub struct Server {
    config: Config,
    lifecycle: Lifecycle,
    access_log: Arc<AccessLog>,
    stats: Arc<ServerStats>,
    registry: Arc<ConnectionRegistry>,
    observers: Arc<Observers>,
    running: Option<Running>,
}

impl Server {
    pub fn new(mut config: Config) -> Self {
        let access_log = Arc::new(AccessLog::new(std::mem::take(&mut config.log_sink)));
        Self {
            config,
            lifecycle: Lifecycle::Stopped,
            access_log,
            stats: Arc::new(ServerStats::default()),
            registry: ConnectionRegistry::new(),
            observers: Arc::new(Observers::default()),
            running: None,
        }
    }

    /// Change the shared folder and port. Only allowed while stopped.
    pub fn configure(&mut self, root: Option<PathBuf>, port: u16) -> Result<(), Error> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.config.root = root;
        self.config.bindport = port;
        Ok(())
    }

    pub fn subscribe(&self) -> Receiver<ServerEvent> {
        self.observers.subscribe()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn is_running(&self) -> bool {
        self.lifecycle == Lifecycle::Running
    }

    /// Address the listener is bound to, while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.as_ref().map(|running| running.local_addr)
    }

    /// The bound address in a form suitable for display.
    pub fn bound_address(&self) -> Option<String> {
        self.local_addr().map(|addr| format!("http://{}/", addr))
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn connection_count(&self) -> usize {
        self.registry.len()
    }

    pub fn logs_to_stdout(&self) -> bool {
        self.access_log.is_stdout()
    }

    pub fn start(&mut self) -> Result<(), Error> {
        if self.running.is_some() {
            return Err(Error::AlreadyRunning);
        }
        self.lifecycle = Lifecycle::Starting;
        match self.bind() {
            Ok(running) => {
                let addr = running.local_addr;
                self.running = Some(running);
                self.lifecycle = Lifecycle::Running;
                log::info!("listening on: http://{}/", addr);
                self.observers.publish(ServerEvent::Ready(addr));
                Ok(())
            }
            Err(e) => {
                self.lifecycle = Lifecycle::Stopped;
                log::error!("{}", e);
                self.observers.publish(ServerEvent::Failed(e.to_string()));
                Err(e)
            }
        }
    }

    fn bind(&self) -> Result<Running, Error> {
        let root = self
            .config
            .root
            .as_deref()
            .map(canonical_root)
            .transpose()?;
        let addr = self.config.socket_addr()?;
        // Sets `SO_REUSEADDR` implicitly.
        let listener = TcpListener::bind(addr).map_err(|source| Error::Bind { addr, source })?;
        listener
            .set_nonblocking(true)
            .map_err(|source| Error::Bind { addr, source })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| Error::Bind { addr, source })?;

        let (wake_read, wake_write) = pipe().map_err(Error::WakePipe)?;
        // The pipe descriptors are fresh and owned by nobody else.
        let (wake_read, wake_write) =
            unsafe { (File::from_raw_fd(wake_read), File::from_raw_fd(wake_write)) };

        let acceptor = Acceptor {
            listener,
            wake: wake_read,
            registry: Arc::clone(&self.registry),
            observers: Arc::clone(&self.observers),
            timeout: self.config.timeout,
            max_connections: self.config.max_connections,
            shared: Arc::new(Shared {
                root,
                mime_map: self.config.mime_map.clone(),
                responder: Responder::new(self.config.want_no_server_id),
                access_log: Arc::clone(&self.access_log),
                stats: Arc::clone(&self.stats),
                max_upload: self.config.max_upload,
                overwrite_uploads: self.config.overwrite_uploads,
            }),
        };
        let accept_thread = thread::Builder::new()
            .name("accept".to_string())
            .spawn(move || acceptor.run())
            .map_err(Error::Spawn)?;

        Ok(Running {
            local_addr,
            wake: wake_write,
            accept_thread,
        })
    }

    /// Stop accepting, then cancel every open connection. Does nothing if not running.
    pub fn stop(&mut self) {
        let mut running = match self.running.take() {
            Some(running) => running,
            None => return,
        };
        self.lifecycle = Lifecycle::Stopping;
        if let Err(e) = running.wake.write_all(b"x") {
            log::error!("failed to wake accept thread: {}", e);
        }
        if running.accept_thread.join().is_err() {
            log::error!("accept thread panicked");
        }
        let cancelled = self.registry.cancel_all();
        if cancelled > 0 {
            log::info!("cancelled {} open connections", cancelled);
        }
        self.lifecycle = Lifecycle::Stopped;
        log::info!("stopped listening on http://{}/", running.local_addr);
        self.observers.publish(ServerEvent::Stopped);
    }
}

impl Drop for Server {
    fn drop(&mut self) {
        self.stop();
    }
}

fn canonical_root(root: &Path) -> Result<PathBuf, Error> {
    let canonical = root.canonicalize().map_err(|source| Error::InvalidRoot {
        path: root.to_path_buf(),
        source,
    })?;
    if !canonical.is_dir() {
        return Err(Error::RootNotDirectory(canonical));
    }
    Ok(canonical)
}

/// State owned by the accept thread.
struct Acceptor {
    listener: TcpListener,
    wake: File,
    registry: Arc<ConnectionRegistry>,
    observers: Arc<Observers>,
    timeout: Option<Duration>,
    max_connections: Option<usize>,
    shared: Arc<Shared>,
}

impl Acceptor {
    /// A select() on the listener and the wake pipe, then delegation to accept connections.
    fn run(self) {
        let mut files_exhausted = false;
        let mut paused = false;
        loop {
            let reached_max_connections =
                matches!(self.max_connections, Some(num) if self.registry.len() >= num);
            let pause = files_exhausted || reached_max_connections;
            if pause && !paused {
                let reason = if files_exhausted {
                    "out of file descriptors".to_string()
                } else {
                    format!("reached {} connections", self.registry.len())
                };
                log::warn!("not accepting connections: {}", reason);
                self.observers.publish(ServerEvent::Waiting(reason));
            }
            paused = pause;

            let mut recv_set = FdSet::new();
            recv_set.insert(self.wake.as_raw_fd());
            if !paused {
                recv_set.insert(self.listener.as_raw_fd());
            }
            // While paused, wake up now and then to see whether a connection has closed.
            let mut timeout = Some(TimeVal::from(libc::timeval {
                tv_sec: 0,
                tv_usec: ACCEPT_RETRY.as_micros() as libc::suseconds_t,
            }))
            .filter(|_| paused);

            match select(None, Some(&mut recv_set), None, None, timeout.as_mut()) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    let reason = format!("select() failed: {}", e);
                    log::error!("{}", reason);
                    self.observers.publish(ServerEvent::Failed(reason));
                    self.registry.cancel_all();
                    return;
                }
            }

            if recv_set.contains(self.wake.as_raw_fd()) {
                return;
            }
            if paused {
                // try again to see if descriptors have been freed
                files_exhausted = false;
            } else if recv_set.contains(self.listener.as_raw_fd()) {
                self.accept_connection(&mut files_exhausted);
            }
        }
    }

    fn accept_connection(&self, files_exhausted: &mut bool) {
        let (stream, addr) = match self.listener.accept() {
            Ok((stream, addr)) => (stream, addr),
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => return,
            Err(e) => {
                // Failed to accept, but try to keep serving existing connections.
                if matches!(e.raw_os_error(), Some(libc::EMFILE) | Some(libc::ENFILE)) {
                    *files_exhausted = true;
                }
                log::warn!("accept() failed: {}", e);
                return;
            }
        };
        if let Err(e) = self.prepare(&stream) {
            log::warn!("dropping connection from {}: {}", addr, e);
            return;
        }

        let id = ConnectionId::next();
        let registration = self.registry.register(id, &stream);
        let shared = Arc::clone(&self.shared);
        log::debug!("connection {} from {}", id, addr);
        let spawned = thread::Builder::new()
            .name(format!("connection {}", id))
            .spawn(move || Connection::new(stream, addr.ip(), registration, shared).run());
        if let Err(e) = spawned {
            log::warn!("failed to spawn thread for connection {}: {}", id, e);
        }
    }

    /// Connection threads use blocking I/O bounded by the idle timeout.
    fn prepare(&self, stream: &TcpStream) -> std::io::Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(self.timeout)?;
        stream.set_write_timeout(self.timeout)?;
        Ok(())
    }
}
