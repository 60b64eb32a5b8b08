//! Serving one request on a pooled compiler.

use std::io::{self, BufRead, BufReader, BufWriter};
use std::net::{Shutdown, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use kiln_protocol::{
    CompilationResult, CompileRequest, ProtocolError, ReturnCode, SourceSuffixes, SysInfo,
    read_request, write_response,
};
use tracing::{debug, info, warn};

use crate::compiler::{CompileInvocation, Compiler};
use crate::pool::{CompilerPool, panic_message};

pub(crate) const WORKER_TARGET: &str = concat!(env!("CARGO_PKG_NAME"), "::worker");

/// Facts about the server that every request needs.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Cookie clients must present.
    pub cookie: u64,
    /// Suffixes marking explicit source files among the arguments.
    pub suffixes: SourceSuffixes,
    /// Capacity reported with every response.
    pub sys_info: SysInfo,
    /// Bound on waiting for the request to arrive.
    pub request_timeout: Duration,
}

/// What became of a served connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionOutcome {
    /// The peer sent (at least the start of) a request.
    Served,
    /// The peer sent nothing before closing or timing out.
    Abandoned,
}

/// A pooled worker: one warm compiler, bound to at most one connection.
pub struct CompilerThread {
    id: usize,
    compiler: Box<dyn Compiler>,
    pool: Arc<CompilerPool>,
    connection: Option<TcpStream>,
    poisoned: bool,
}

impl std::fmt::Debug for CompilerThread {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("CompilerThread")
            .field("id", &self.id)
            .field("bound", &self.connection.is_some())
            .field("poisoned", &self.poisoned)
            .finish_non_exhaustive()
    }
}

impl CompilerThread {
    pub(crate) fn new(id: usize, compiler: Box<dyn Compiler>, pool: Arc<CompilerPool>) -> Self {
        Self {
            id,
            compiler,
            pool,
            connection: None,
            poisoned: false,
        }
    }

    /// Pool-assigned worker number.
    #[must_use]
    pub const fn id(&self) -> usize {
        self.id
    }

    /// Attaches the connection the next [`CompilerThread::run`] serves.
    pub fn bind(&mut self, connection: TcpStream) {
        self.connection = Some(connection);
    }

    /// Serves the bound connection: reads one request, compiles, answers.
    ///
    /// Never fails: every problem is reported to the client when possible and
    /// logged otherwise. The connection is shut down on every path.
    #[must_use]
    pub fn run(&mut self, context: &RequestContext) -> ConnectionOutcome {
        let Some(connection) = self.connection.take() else {
            warn!(target: WORKER_TARGET, worker = self.id, "run called without a connection");
            return ConnectionOutcome::Abandoned;
        };
        let outcome = match self.serve(&connection, context) {
            Ok(outcome) => outcome,
            Err(error) => {
                match error {
                    ProtocolError::UnexpectedEof { .. } => debug!(
                        target: WORKER_TARGET,
                        worker = self.id,
                        %error,
                        "client closed the connection early"
                    ),
                    _ => warn!(target: WORKER_TARGET, worker = self.id, %error, "request failed"),
                }
                ConnectionOutcome::Served
            }
        };
        if let Err(error) = connection.shutdown(Shutdown::Both) {
            debug!(target: WORKER_TARGET, worker = self.id, %error, "connection already closed");
        }
        outcome
    }

    pub(crate) fn into_parts(self) -> (usize, Box<dyn Compiler>, bool) {
        (self.id, self.compiler, self.poisoned)
    }

    fn serve(
        &mut self,
        connection: &TcpStream,
        context: &RequestContext,
    ) -> Result<ConnectionOutcome, ProtocolError> {
        let started = Instant::now();
        connection.set_read_timeout(Some(context.request_timeout))?;
        let mut reader = BufReader::new(connection);
        match reader.fill_buf() {
            Ok([]) => {
                debug!(
                    target: WORKER_TARGET,
                    worker = self.id,
                    "connection closed without a request"
                );
                return Ok(ConnectionOutcome::Abandoned);
            }
            Ok(_) => {}
            Err(error) if is_timeout(&error) => {
                let timeout_ms =
                    u64::try_from(context.request_timeout.as_millis()).unwrap_or(u64::MAX);
                info!(
                    target: WORKER_TARGET,
                    worker = self.id,
                    timeout_ms,
                    "no request received; closing the connection"
                );
                let failure = CompilationResult::failure(
                    ReturnCode::ErrorFatal,
                    format!("no request received within {:?}", context.request_timeout),
                );
                write_response(&mut BufWriter::new(connection), &failure)?;
                return Ok(ConnectionOutcome::Abandoned);
            }
            Err(error) => return Err(error.into()),
        }
        let mut result = match read_request(&mut reader, &context.suffixes) {
            Ok(request) if request.cookie != context.cookie => {
                info!(
                    target: WORKER_TARGET,
                    worker = self.id,
                    id = %request.id,
                    "rejecting request with a stale cookie"
                );
                CompilationResult::failure(
                    ReturnCode::ErrorButTryAgain,
                    "server cookie mismatch; the client read an outdated port file",
                )
            }
            Ok(request) if request.is_empty() => {
                debug!(target: WORKER_TARGET, worker = self.id, id = %request.id, "capacity query");
                CompilationResult::new(ReturnCode::Ok)
            }
            Ok(request) => self.compile(&request),
            Err(error @ ProtocolError::UnexpectedEof { .. }) => return Err(error),
            Err(error) => {
                let mut writer = BufWriter::new(connection);
                let failure = CompilationResult::failure(
                    ReturnCode::ErrorFatal,
                    format!("malformed request: {error}"),
                );
                write_response(&mut writer, &failure)?;
                return Err(error);
            }
        };
        result.sys_info = context.sys_info;

        let mut writer = BufWriter::new(connection);
        write_response(&mut writer, &result)?;
        info!(
            target: WORKER_TARGET,
            worker = self.id,
            return_code = %result.return_code,
            elapsed_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            "request served"
        );
        Ok(ConnectionOutcome::Served)
    }

    fn compile(&mut self, request: &CompileRequest) -> CompilationResult {
        debug!(
            target: WORKER_TARGET,
            worker = self.id,
            id = %request.id,
            options = request.options.len(),
            sources = request.sources_to_compile.len(),
            "compiling"
        );
        let invocation = CompileInvocation::from_request(request);
        let scope = self.pool.subtask_scope();
        let compiler = &mut self.compiler;
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
            compiler.compile(&invocation, &scope)
        }));
        let failures = scope.wait();

        let mut result = match outcome {
            Ok(output) => CompilationResult::from(output),
            Err(payload) => {
                self.poisoned = true;
                let message = panic_message(&*payload);
                warn!(
                    target: WORKER_TARGET,
                    worker = self.id,
                    id = %request.id,
                    panic = %message,
                    "compiler panicked"
                );
                CompilationResult::failure(
                    ReturnCode::ErrorFatal,
                    format!("compiler crashed: {message}"),
                )
            }
        };
        if !failures.is_empty() {
            for failure in &failures {
                result.append_stderr(failure);
            }
            if result.return_code.is_success() {
                result.return_code = ReturnCode::ErrorFatal;
            }
        }
        result
    }
}

fn is_timeout(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}
