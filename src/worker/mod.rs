//! Per-request worker.
//!
//! A worker is a forked copy of the server that owns exactly one client
//! connection. It walks the handshake strictly in order:
//!
//! ```text
//! write pid ─► take over stdio ─► cwd | stop ─► env ─► args ─► dispatch ─► status byte
//!                                      │
//!                                      └─ stop: SIGQUIT the server, report '0', exit
//! ```
//!
//! From the moment the client's streams are in place, every way out of the
//! worker goes through [`ExitReporter`], which writes the status byte
//! exactly once.

// Rust guideline compliant 2026-02

pub mod dispatch;
pub mod request;

use std::io::{self, BufReader, Write};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;
use std::path::PathBuf;

use anyhow::{Context, Result};

use crate::config::vars;
use crate::lua::LuaRuntime;
use crate::process;
use crate::protocol::{self, STOP_KEYWORD};

pub use dispatch::{Completion, Dispatch, StandardDispatch, MISSING_CODE_MESSAGE};
pub use request::{RequestContext, RequestKind};

/// Sends the final status byte for one connection.
///
/// [`ExitReporter::finish`] consumes the reporter, so a second report is
/// impossible; if the reporter is dropped without finishing (an early
/// return or a panic), the drop reports an abnormal exit.
pub struct ExitReporter {
    stream: UnixStream,
    reported: bool,
}

impl std::fmt::Debug for ExitReporter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExitReporter")
            .field("reported", &self.reported)
            .finish_non_exhaustive()
    }
}

impl ExitReporter {
    /// Take ownership of the connection.
    pub fn new(stream: UnixStream) -> Self {
        Self {
            stream,
            reported: false,
        }
    }

    /// The connection, for reading the rest of the request.
    pub fn stream(&self) -> &UnixStream {
        &self.stream
    }

    /// Report the outcome and close the connection.
    pub fn finish(mut self, normal: bool) {
        self.report(normal);
    }

    fn report(&mut self, normal: bool) {
        if self.reported {
            return;
        }
        self.reported = true;
        // Output must reach the client before it sees the status and exits.
        process::flush_stdio();
        let byte = protocol::status_byte(normal);
        if let Err(e) = (&self.stream).write_all(&[byte]) {
            log::debug!("Failed to send status byte: {e}");
        }
        if let Err(e) = self.stream.shutdown(Shutdown::Write) {
            log::debug!("Failed to half-close connection: {e}");
        }
    }
}

impl Drop for ExitReporter {
    fn drop(&mut self) {
        self.report(false);
    }
}

/// Runs the worker side of the protocol for one connection.
pub struct Worker<'a> {
    runtime: &'a LuaRuntime,
    dispatcher: &'a dyn Dispatch,
    server_pid: libc::pid_t,
}

impl std::fmt::Debug for Worker<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("runtime", self.runtime)
            .field("server_pid", &self.server_pid)
            .finish_non_exhaustive()
    }
}

impl<'a> Worker<'a> {
    /// Worker for a server with pid `server_pid`.
    pub fn new(
        runtime: &'a LuaRuntime,
        dispatcher: &'a dyn Dispatch,
        server_pid: libc::pid_t,
    ) -> Self {
        Self {
            runtime,
            dispatcher,
            server_pid,
        }
    }

    /// Handle the connection and return the worker's exit code.
    pub fn run(&self, stream: UnixStream) -> i32 {
        match self.serve(stream) {
            Ok(code) => code,
            Err(e) => {
                log::debug!("Worker {} ended early: {e:#}", std::process::id());
                1
            }
        }
    }

    fn serve(&self, stream: UnixStream) -> Result<i32> {
        protocol::write_pid(&mut &stream, std::process::id())
            .context("Failed to announce worker pid")?;
        let stdio = protocol::recv_stdio(&stream)?;
        process::replace_stdio(stdio)?;

        let reporter = ExitReporter::new(stream);
        let mut reader = BufReader::new(reporter.stream());

        let dir = PathBuf::from(protocol::expect_os_line(&mut reader, "working directory")?);
        if dir.as_os_str() == STOP_KEYWORD {
            drop(reader);
            self.stop_server();
            reporter.finish(true);
            return Ok(0);
        }
        if let Err(e) = std::env::set_current_dir(&dir) {
            eprintln!("{}: {e}", dir.display());
            drop(reader);
            reporter.finish(false);
            return Ok(1);
        }

        let env = protocol::read_env(&mut reader)?;
        process::replace_env(&env);
        let args = protocol::read_args(&mut reader).context("Failed to read arguments")?;
        drop(reader);

        let request = RequestContext { cwd: dir, env, args };
        let completion = self
            .dispatcher
            .dispatch(self.runtime, &request)
            .with_pending_exit(self.runtime);
        if let Completion::Failed(e) = &completion {
            eprintln!("{e:#}");
        }
        reporter.finish(completion.is_normal());

        if request.env_var(vars::DEBUG) == Some("log") {
            let stdout = io::stdout();
            if let Err(e) = self.runtime.print_loaded_features(&mut stdout.lock()) {
                log::debug!("Failed to print loaded features: {e}");
            }
        }
        Ok(completion.exit_code())
    }

    /// Ask the server to stop accepting (the quit path).
    fn stop_server(&self) {
        if self.server_pid <= 1 {
            log::warn!("Not signalling server: invalid pid {}", self.server_pid);
            return;
        }
        match process::send_signal(self.server_pid, libc::SIGQUIT) {
            Ok(()) => log::debug!("Sent SIGQUIT to server {}", self.server_pid),
            Err(e) => eprintln!("Failed to stop server {}: {e}", self.server_pid),
        }
    }
}
