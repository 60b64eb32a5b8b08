//! Shared fixtures: instrumented compilers and a minimal protocol client.

use std::collections::BTreeSet;
use std::io::BufReader;
use std::net::{Ipv4Addr, TcpStream};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, bail};
use kiln_config::ServerSettings;
use kiln_portfile::PortFileRegistry;
use kiln_protocol::{CompilationResult, CompileRequest, ReturnCode, read_response, write_request};
use tempfile::TempDir;
use url::Url;

use crate::compiler::{CompileInvocation, CompileOutput, Compiler, CompilerFactory};
use crate::pool::SubtaskScope;
use crate::server::{RunningServer, Server};

/// Isolated directory holding a port file and the settings pointing at it.
pub(crate) struct Scratch {
    _dir: TempDir,
    pub(crate) settings: ServerSettings,
    pub(crate) registry: PortFileRegistry,
}

impl Scratch {
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
            registry: PortFileRegistry::new(),
        })
    }

    pub(crate) fn portfile(&self) -> PathBuf {
        self.settings.portfile.clone()
    }

    pub(crate) fn bind(&self, factory: Arc<dyn CompilerFactory>) -> Result<Server> {
        Ok(Server::bind(self.settings.clone(), &self.registry, factory)?)
    }

    pub(crate) fn start(&self, factory: Arc<dyn CompilerFactory>) -> Result<RunningServer> {
        Ok(self.bind(factory)?.spawn())
    }
}

/// Counts how many compilations run at once.
#[derive(Debug, Default)]
pub(crate) struct Concurrency {
    current: AtomicUsize,
    peak: AtomicUsize,
    finished: AtomicUsize,
}

impl Concurrency {
    pub(crate) fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    pub(crate) fn finished(&self) -> usize {
        self.finished.load(Ordering::SeqCst)
    }
}

/// Sleeps for a fixed time and reports one package.
pub(crate) struct SleepyCompiler {
    delay: Duration,
    concurrency: Arc<Concurrency>,
}

impl Compiler for SleepyCompiler {
    fn compile(&mut self, invocation: &CompileInvocation, _: &SubtaskScope) -> CompileOutput {
        let now = self.concurrency.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.concurrency.peak.fetch_max(now, Ordering::SeqCst);
        thread::sleep(self.delay);
        self.concurrency.current.fetch_sub(1, Ordering::SeqCst);
        self.concurrency.finished.fetch_add(1, Ordering::SeqCst);

        let mut output = CompileOutput::success();
        output.stdout = format!("compiled {}", invocation.id);
        if let Ok(artifact) = Url::parse("file:///out/demo/A.class") {
            output
                .package_artifacts
                .insert(String::from("demo"), BTreeSet::from([artifact]));
        }
        output
            .package_pubapis
            .insert(String::from("demo"), String::from("TYPE demo.A"));
        output
    }
}

pub(crate) fn sleepy_factory(
    delay: Duration,
    concurrency: &Arc<Concurrency>,
) -> Arc<dyn CompilerFactory> {
    let concurrency = Arc::clone(concurrency);
    Arc::new(move || -> Box<dyn Compiler> {
        Box::new(SleepyCompiler {
            delay,
            concurrency: Arc::clone(&concurrency),
        })
    })
}

pub(crate) fn quick_factory() -> Arc<dyn CompilerFactory> {
    sleepy_factory(Duration::ZERO, &Arc::new(Concurrency::default()))
}

/// Sends one request to `port` and reads the response.
pub(crate) fn send(port: u16, request: &CompileRequest) -> Result<CompilationResult> {
    let stream = TcpStream::connect((Ipv4Addr::LOCALHOST, port)).context("connect")?;
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .context("set timeout")?;
    let mut writer = &stream;
    write_request(&mut writer, request).context("write request")?;
    let mut reader = BufReader::new(&stream);
    Ok(read_response(&mut reader).context("read response")?)
}

pub(crate) fn request_for(cookie: u64, id: &str) -> CompileRequest {
    CompileRequest {
        cookie,
        cwd: String::from("/work"),
        id: String::from(id),
        options: vec![String::from("-g")],
        ..CompileRequest::default()
    }
}

/// Sends a request and insists on success.
pub(crate) fn compile_ok(port: u16, cookie: u64, id: &str) -> Result<CompilationResult> {
    let result = send(port, &request_for(cookie, id))?;
    if result.return_code != ReturnCode::Ok {
        bail!("request {id} failed with {}: {}", result.return_code, result.stderr);
    }
    Ok(result)
}

/// Polls `condition` until it holds or `timeout` elapses.
pub(crate) fn wait_until(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    condition()
}
