//! Server lifecycle: claim the port file, accept connections, shut down.
//!
//! A [`Server`] moves through four states. While *claiming* it binds a
//! loopback listener and records its port and cookie in the port file. While
//! *running* a single accept thread hands every connection to a pooled
//! worker and, once per poll interval, checks whether it should stop. After
//! staying idle for longer than the keepalive it deletes its port file and
//! *drains*: clients that already read the old record are still served until
//! the drain grace elapses. Finally it is *stopped*: the pool is shut down and
//! the port file is removed if the server still owns it.

mod errors;

use std::io;
use std::net::{Ipv4Addr, SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use kiln_config::ServerSettings;
use kiln_portfile::{PortFile, PortFileError, PortFileRegistry, PortFileValues};
use kiln_protocol::SourceSuffixes;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::compiler::CompilerFactory;
use crate::host::host_sys_info;
use crate::pool::CompilerPool;
use crate::worker::{ConnectionOutcome, RequestContext};

pub use errors::ServerError;

pub(crate) const SERVER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::server");

const ACCEPT_BACKOFF: Duration = Duration::from_millis(25);
const ERROR_BACKOFF: Duration = Duration::from_millis(150);
const LIVENESS_TIMEOUT: Duration = Duration::from_millis(500);

/// Why a server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopReason {
    /// [`ServerHandle::shutdown`] was called.
    Requested,
    /// The keepalive expired and the drain grace elapsed.
    Idle,
    /// Someone else deleted the port file.
    PortFileRemoved,
    /// The port file was marked for stop.
    StopMarked,
    /// Another server overwrote the port file.
    PortFileTaken,
}

/// Summary of a finished server run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ServerReport {
    /// Why the server stopped.
    pub reason: StopReason,
    /// Connections served over the server's lifetime.
    pub requests_served: u64,
}

/// Requests a running server to stop at its next accept iteration.
#[derive(Debug, Clone)]
pub struct ServerHandle {
    shutdown: Arc<AtomicBool>,
}

impl ServerHandle {
    /// Asks the server to stop.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::SeqCst);
    }

    /// Returns true once a stop was requested.
    #[must_use]
    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }
}

/// A claimed server, ready to run.
#[derive(Debug)]
pub struct Server {
    settings: ServerSettings,
    listener: TcpListener,
    port: u16,
    cookie: u64,
    port_file: Arc<PortFile>,
    pool: Arc<CompilerPool>,
    context: Arc<RequestContext>,
    shutdown: Arc<AtomicBool>,
}

impl Server {
    /// Binds a loopback listener and claims the configured port file.
    ///
    /// # Errors
    ///
    /// Fails when the settings are invalid, the listener cannot be bound, the
    /// port file cannot be written, or a live server already owns it. In the
    /// last case the port file is left untouched.
    pub fn bind(
        settings: ServerSettings,
        registry: &PortFileRegistry,
        factory: Arc<dyn CompilerFactory>,
    ) -> Result<Self, ServerError> {
        settings
            .validate()
            .map_err(|source| ServerError::Settings { source })?;
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
            .map_err(|source| ServerError::Bind { source })?;
        let port = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { source })?
            .port();
        let cookie = rand::thread_rng().gen_range(1..=u64::MAX);
        let port_file = registry.port_file(&settings.portfile)?;
        claim(&port_file, port, cookie)?;

        let context = RequestContext {
            cookie,
            suffixes: SourceSuffixes::default(),
            sys_info: host_sys_info(),
            request_timeout: settings.request_timeout,
        };
        info!(
            target: SERVER_TARGET,
            port,
            poolsize = settings.poolsize,
            keepalive_secs = settings.keepalive.as_secs(),
            file = %port_file.path().display(),
            "server listening"
        );
        Ok(Self {
            pool: CompilerPool::new(factory, settings.poolsize),
            settings,
            listener,
            port,
            cookie,
            port_file,
            context: Arc::new(context),
            shutdown: Arc::new(AtomicBool::new(false)),
        })
    }

    /// Loopback port the server accepts connections on.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Secret recorded in the port file.
    #[must_use]
    pub const fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Port file owned by this server.
    #[must_use]
    pub const fn port_file(&self) -> &Arc<PortFile> {
        &self.port_file
    }

    /// Handle that stops the server from another thread.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            shutdown: Arc::clone(&self.shutdown),
        }
    }

    /// Runs the accept loop until the server decides to stop.
    ///
    /// # Errors
    ///
    /// Returns an error when a lifecycle check or the pool fails; the pool is
    /// shut down first either way.
    pub fn run(self) -> Result<ServerReport, ServerError> {
        let outcome = self.accept_loop();
        self.pool.shutdown();
        self.release_port_file();
        let reason = outcome?;
        let report = ServerReport {
            reason,
            requests_served: self.pool.requests_served(),
        };
        info!(
            target: SERVER_TARGET,
            reason = ?report.reason,
            served = report.requests_served,
            "server stopped"
        );
        Ok(report)
    }

    /// Runs the server on a background thread.
    #[must_use]
    pub fn spawn(self) -> RunningServer {
        let handle = self.handle();
        let port = self.port;
        let cookie = self.cookie;
        let thread = thread::spawn(move || self.run());
        RunningServer {
            handle,
            port,
            cookie,
            thread,
        }
    }

    fn accept_loop(&self) -> Result<StopReason, ServerError> {
        self.listener
            .set_nonblocking(true)
            .map_err(|source| ServerError::Listener { source })?;
        let mut next_check = Instant::now() + self.settings.poll_interval;
        let mut draining_since = None::<Instant>;
        let mut last_error = None::<io::ErrorKind>;
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                return Ok(StopReason::Requested);
            }
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    last_error = None;
                    self.dispatch(stream, peer)?;
                }
                Err(error) if error.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_BACKOFF);
                }
                Err(error) => {
                    let kind = error.kind();
                    if last_error != Some(kind) {
                        warn!(target: SERVER_TARGET, %error, "accept error");
                    }
                    last_error = Some(kind);
                    thread::sleep(ERROR_BACKOFF);
                }
            }

            if let Some(since) = draining_since
                && self.drained(since)
            {
                return Ok(StopReason::Idle);
            }
            let now = Instant::now();
            if now >= next_check {
                next_check = now + self.settings.poll_interval;
                if let Some(reason) = self.check_lifecycle(&mut draining_since)? {
                    return Ok(reason);
                }
            }
        }
    }

    /// Lifecycle checks, in priority order.
    fn check_lifecycle(
        &self,
        draining_since: &mut Option<Instant>,
    ) -> Result<Option<StopReason>, ServerError> {
        if self.pool.active_count() > 0 {
            return Ok(None);
        }
        if let Some(since) = *draining_since {
            return Ok(self.drained(since).then_some(StopReason::Idle));
        }
        if !self.port_file.exists() {
            info!(target: SERVER_TARGET, "port file removed externally");
            return Ok(Some(StopReason::PortFileRemoved));
        }
        if self.port_file.marked_for_stop() {
            info!(target: SERVER_TARGET, "port file marked for stop");
            self.port_file.delete()?;
            return Ok(Some(StopReason::StopMarked));
        }
        if !self.port_file.still_my_values(self.port, self.cookie)? {
            info!(target: SERVER_TARGET, "port file now names another server");
            return Ok(Some(StopReason::PortFileTaken));
        }
        let idle = self.pool.last_request_finished().elapsed();
        if idle > self.settings.keepalive {
            info!(
                target: SERVER_TARGET,
                idle_secs = idle.as_secs(),
                "keepalive expired; draining"
            );
            self.port_file.delete()?;
            *draining_since = Some(Instant::now());
        }
        Ok(None)
    }

    fn drained(&self, since: Instant) -> bool {
        self.pool.active_count() == 0 && since.elapsed() >= self.settings.drain_grace
    }

    fn dispatch(&self, stream: TcpStream, peer: SocketAddr) -> Result<(), ServerError> {
        if let Err(error) = stream.set_nonblocking(false) {
            warn!(target: SERVER_TARGET, %peer, %error, "dropping connection");
            return Ok(());
        }
        self.pool.start_request();
        let mut worker = match self.pool.grab() {
            Ok(worker) => worker,
            Err(source) => {
                self.pool.finish_request();
                return Err(ServerError::Pool { source });
            }
        };
        debug!(target: SERVER_TARGET, %peer, worker = worker.id(), "connection accepted");
        let pool = Arc::clone(&self.pool);
        let context = Arc::clone(&self.context);
        thread::spawn(move || {
            worker.bind(stream);
            let outcome = worker.run(&context);
            pool.release(worker);
            match outcome {
                ConnectionOutcome::Served => pool.finish_request(),
                ConnectionOutcome::Abandoned => pool.abandon_request(),
            }
        });
        Ok(())
    }

    fn release_port_file(&self) {
        let owned = match self.port_file.still_my_values(self.port, self.cookie) {
            Ok(owned) => owned,
            Err(error) => {
                warn!(target: SERVER_TARGET, %error, "could not check port file ownership");
                false
            }
        };
        if owned && let Err(error) = self.port_file.delete() {
            warn!(target: SERVER_TARGET, %error, "failed to remove port file");
        }
    }
}

/// A server running on a background thread.
#[derive(Debug)]
pub struct RunningServer {
    handle: ServerHandle,
    port: u16,
    cookie: u64,
    thread: JoinHandle<Result<ServerReport, ServerError>>,
}

impl RunningServer {
    /// Loopback port of the server.
    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Cookie of the server.
    #[must_use]
    pub const fn cookie(&self) -> u64 {
        self.cookie
    }

    /// Handle that stops the server.
    #[must_use]
    pub fn handle(&self) -> ServerHandle {
        self.handle.clone()
    }

    /// Returns true once the server thread ended.
    #[must_use]
    pub fn is_finished(&self) -> bool {
        self.thread.is_finished()
    }

    /// Waits for the server to stop.
    ///
    /// # Errors
    ///
    /// Returns the server's own error, or [`ServerError::ThreadPanic`].
    pub fn join(self) -> Result<ServerReport, ServerError> {
        self.thread.join().map_err(|_| ServerError::ThreadPanic)?
    }

    /// Requests a stop and waits for it.
    ///
    /// # Errors
    ///
    /// As for [`RunningServer::join`].
    pub fn stop(self) -> Result<ServerReport, ServerError> {
        self.handle.shutdown();
        self.join()
    }
}

/// Records `port` and `cookie`, unless a live server already owns the file.
fn claim(port_file: &PortFile, port: u16, cookie: u64) -> Result<(), ServerError> {
    let lock = port_file.lock()?;
    match lock.values() {
        Ok(Some(existing)) if existing.is_valid() && is_listening(existing.port) => {
            info!(
                target: SERVER_TARGET,
                port = existing.port,
                pid = existing.pid,
                "refusing to start: existing server alive"
            );
            return Err(ServerError::AlreadyRunning {
                path: port_file.path().to_path_buf(),
                port: existing.port,
                pid: existing.pid,
            });
        }
        Ok(Some(existing)) => {
            warn!(
                target: SERVER_TARGET,
                port = existing.port,
                pid = existing.pid,
                "existing server not detected; replacing stale port file"
            );
        }
        Ok(None) => {}
        Err(error @ PortFileError::Decode { .. }) => {
            warn!(target: SERVER_TARGET, %error, "replacing malformed port file");
        }
        Err(error) => return Err(error.into()),
    }
    lock.delete()?;
    lock.set_values(&PortFileValues::new(port, cookie))?;
    Ok(())
}

fn is_listening(port: u16) -> bool {
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    TcpStream::connect_timeout(&address, LIVENESS_TIMEOUT).is_ok()
}
