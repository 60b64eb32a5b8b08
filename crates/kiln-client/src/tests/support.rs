//! Fixtures: scratch port files, a scripted fake server and test compilers.

use std::io::{BufReader, BufWriter};
use std::net::{Ipv4Addr, TcpListener};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use kiln_config::ServerSettings;
use kiln_portfile::{PortFile, PortFileRegistry, PortFileValues};
use kiln_protocol::{
    CompilationResult, CompileRequest, ReturnCode, SourceSuffixes, read_request, write_response,
};
use kilnd::{CompileInvocation, CompileOutput, Compiler, CompilerFactory, SubtaskScope};
use tempfile::TempDir;

use crate::errors::LaunchError;
use crate::launcher::{InProcessLauncher, ServerLauncher};
use crate::service::{RetryPolicy, ServiceClient};

/// Policy with short pauses so retry tests stay fast.
pub(crate) const FAST_POLICY: RetryPolicy = RetryPolicy {
    attempts: 3,
    backoff: Duration::from_millis(100),
    connect_timeout: Duration::from_millis(500),
    startup_timeout: Duration::from_secs(5),
};

/// Isolated directory holding a port file and the settings pointing at it.
pub(crate) struct Sandbox {
    _dir: TempDir,
    pub(crate) settings: ServerSettings,
    pub(crate) registry: Arc<PortFileRegistry>,
}

impl Sandbox {
    pub(crate) fn new() -> Result<Self> {
        let dir = TempDir::new().context("create temp dir")?;
        let mut settings = ServerSettings::new(dir.path().join("kilnd.port"));
        settings.poolsize = 2;
        settings.keepalive = Duration::from_secs(60);
        settings.poll_interval = Duration::from_millis(50);
        settings.drain_grace = Duration::from_millis(100);
        Ok(Self {
            _dir: dir,
            settings,
            registry: Arc::new(PortFileRegistry::new()),
        })
    }

    pub(crate) fn port_file(&self) -> Result<Arc<PortFile>> {
        self.registry
            .port_file(&self.settings.portfile)
            .context("resolve port file")
    }

    /// Records `values` as if a server had published them.
    pub(crate) fn record(&self, values: PortFileValues) -> Result<()> {
        let port_file = self.port_file()?;
        let lock = port_file.lock().context("lock port file")?;
        lock.set_values(&values).context("write port file")
    }

    pub(crate) fn client(&self, launcher: Arc<dyn ServerLauncher>) -> ServiceClient {
        ServiceClient::new(self.settings.clone(), launcher)
            .with_registry(Arc::clone(&self.registry))
            .with_retry_policy(FAST_POLICY)
    }

    pub(crate) fn in_process_launcher(&self) -> Arc<InProcessLauncher> {
        Arc::new(InProcessLauncher::new(
            echo_factory(),
            Arc::clone(&self.registry),
        ))
    }
}

/// Reports its explicit files on stdout; fails with exit 3 on `-fail`.
struct EchoCompiler;

impl Compiler for EchoCompiler {
    fn compile(&mut self, invocation: &CompileInvocation, _: &SubtaskScope) -> CompileOutput {
        if invocation.options.iter().any(|option| option == "-fail") {
            return CompileOutput::failure(ReturnCode::Exit(3), "error: failure requested");
        }
        let mut output = CompileOutput::success();
        output.stdout = invocation
            .explicit_files
            .iter()
            .map(|file| file.display().to_string())
            .collect::<Vec<_>>()
            .join("\n");
        output
    }
}

pub(crate) fn echo_factory() -> Arc<dyn CompilerFactory> {
    Arc::new(|| -> Box<dyn Compiler> { Box::new(EchoCompiler) })
}

/// Launcher that refuses to start anything and counts how often it was
/// asked.
#[derive(Default)]
pub(crate) struct RefusingLauncher {
    pub(crate) calls: AtomicUsize,
}

impl ServerLauncher for RefusingLauncher {
    fn launch(
        &self,
        _: &ServerSettings,
        _: &PortFile,
        timeout: Duration,
    ) -> Result<PortFileValues, LaunchError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Err(LaunchError::StartupTimeout {
            command: String::from("kilnd --portfile test"),
            timeout,
            output: String::from("refused by test launcher"),
        })
    }
}

/// Loopback listener that answers every request with a scripted result.
pub(crate) struct FakeServer {
    pub(crate) port: u16,
    connections: Arc<AtomicUsize>,
    requests: Arc<Mutex<Vec<CompileRequest>>>,
}

impl FakeServer {
    pub(crate) fn start<F>(reply: F) -> Result<Self>
    where
        F: Fn(&CompileRequest) -> CompilationResult + Send + 'static,
    {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind fake server")?;
        let port = listener.local_addr().context("local address")?.port();
        let connections = Arc::new(AtomicUsize::new(0));
        let requests = Arc::new(Mutex::new(Vec::new()));
        let counted = Arc::clone(&connections);
        let recorded = Arc::clone(&requests);
        thread::spawn(move || {
            for stream in listener.incoming().flatten() {
                counted.fetch_add(1, Ordering::SeqCst);
                let mut reader = BufReader::new(&stream);
                let Ok(request) = read_request(&mut reader, &SourceSuffixes::default()) else {
                    continue;
                };
                let result = reply(&request);
                recorded
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .push(request);
                let mut writer = BufWriter::new(&stream);
                let _ = write_response(&mut writer, &result);
            }
        });
        Ok(Self {
            port,
            connections,
            requests,
        })
    }

    pub(crate) fn connections(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn requests(&self) -> Vec<CompileRequest> {
        self.requests
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}

/// A port nothing listens on.
pub(crate) fn released_port() -> Result<u16> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).context("bind")?;
    Ok(listener.local_addr().context("local address")?.port())
}

pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> Result<()> {
    let deadline = Instant::now() + timeout;
    while !condition() {
        if Instant::now() >= deadline {
            bail!("condition not met within {timeout:?}");
        }
        thread::sleep(Duration::from_millis(20));
    }
    Ok(())
}
