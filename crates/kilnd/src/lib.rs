//! The Kiln compile server.
//!
//! `kilnd` keeps a bounded pool of warm compilers behind a loopback TCP
//! listener. Short-lived build invocations find it through a port file,
//! prove they are talking to the right server with the cookie recorded
//! there, and send one compile request per connection using
//! [`kiln_protocol`]. The server answers with the compiler's output and the
//! per-package metadata an incremental build needs.
//!
//! The server stops on its own once it has been idle for longer than its
//! keepalive, when its port file disappears or is taken over by another
//! server, or when a client marks the port file for stop.

mod compiler;
mod host;
mod launch;
mod pool;
mod server;
mod shutdown;
mod telemetry;
mod worker;

pub use compiler::{
    CommandCompiler, CommandCompilerFactory, CompileInvocation, CompileOutput, Compiler,
    CompilerFactory, SourceView,
};
pub use host::host_sys_info;
pub use launch::{DEFAULT_COMPILER, LaunchError, run, run_server};
pub use pool::{CompilerPool, PoolError, RequestId, SubtaskScope};
pub use server::{RunningServer, Server, ServerError, ServerHandle, ServerReport, StopReason};
pub use shutdown::{ShutdownError, watch_signals};
pub use telemetry::{TelemetryError, TelemetryHandle, initialise as initialise_telemetry};
pub use worker::{CompilerThread, ConnectionOutcome, RequestContext};

#[cfg(test)]
mod tests;
