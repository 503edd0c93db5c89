//! Turning a request into work.
//!
//! A [`Dispatch`] implementation receives the preloaded runtime and the
//! request and reports how the work ended as a [`Completion`]. The worker
//! maps that to the status byte and its own exit code. Any closure with the
//! right signature is a dispatcher, which is how embedders replace the
//! default argument handling.

use std::io::Read;
use std::path::Path;

use anyhow::{Context, Result};

use super::request::{RequestContext, RequestKind};
use crate::lua::{exit_request, LuaRuntime};
use crate::runners::Capabilities;

/// Diagnostic for `-e` without code.
pub const MISSING_CODE_MESSAGE: &str = "no code specified for -e";

/// How a dispatched command ended.
#[derive(Debug)]
pub enum Completion {
    /// Ran to the end.
    Finished,
    /// The command asked to exit with this code.
    Exited(i32),
    /// A runner decided the outcome explicitly (tests passed or not).
    Reported(bool),
    /// Uncaught error.
    Failed(anyhow::Error),
}

impl Completion {
    /// Completion of a command that either returned or raised.
    pub fn from_result(result: Result<()>) -> Self {
        match result {
            Ok(()) => Self::Finished,
            Err(err) => Self::from_error(err),
        }
    }

    /// Completion of a runner that reports pass/fail.
    pub fn from_report(result: Result<bool>) -> Self {
        match result {
            Ok(passed) => Self::Reported(passed),
            Err(err) => Self::from_error(err),
        }
    }

    fn from_error(err: anyhow::Error) -> Self {
        match exit_request(&err) {
            Some(code) => Self::Exited(code),
            None => Self::Failed(err),
        }
    }

    /// Let an `os.exit` the command swallowed (inside a coroutine, say)
    /// override how it ended.
    pub fn with_pending_exit(self, runtime: &LuaRuntime) -> Self {
        match runtime.exit_requested() {
            Some(code) => Self::Exited(code),
            None => self,
        }
    }

    /// Whether the client should see a normal status.
    pub fn is_normal(&self) -> bool {
        match self {
            Self::Finished => true,
            Self::Exited(code) => *code == 0,
            Self::Reported(passed) => *passed,
            Self::Failed(_) => false,
        }
    }

    /// Exit code for the worker process. A non-zero request is kept
    /// non-zero: codes outside 1..=255 are clamped into that range.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::Exited(0) => 0,
            Self::Exited(code) => (*code).clamp(1, 255),
            _ if self.is_normal() => 0,
            _ => 1,
        }
    }
}

/// Handles a request inside the worker.
pub trait Dispatch {
    /// Set up the runtime once in the server, before anything is preloaded.
    fn prepare(&self, _runtime: &LuaRuntime) -> Result<()> {
        Ok(())
    }

    /// Run the request. Streams, cwd, and environment are already the
    /// client's.
    fn dispatch(&self, runtime: &LuaRuntime, request: &RequestContext) -> Completion;
}

impl<F> Dispatch for F
where
    F: Fn(&LuaRuntime, &RequestContext) -> Completion,
{
    fn dispatch(&self, runtime: &LuaRuntime, request: &RequestContext) -> Completion {
        self(runtime, request)
    }
}

/// Default dispatcher: classify the arguments and run the matching kind.
#[derive(Debug, Default)]
pub struct StandardDispatch {
    capabilities: Capabilities,
}

impl StandardDispatch {
    /// Dispatcher using the given capabilities.
    pub fn new(capabilities: Capabilities) -> Self {
        Self { capabilities }
    }

    /// The test runner and REPL in use.
    pub fn capabilities(&self) -> &Capabilities {
        &self.capabilities
    }

    fn run_inline(runtime: &LuaRuntime, code: &str, args: &[String]) -> Result<()> {
        runtime.set_args("-e", args)?;
        runtime.exec_source("-e", code, args)
    }

    fn run_stdin(runtime: &LuaRuntime) -> Result<()> {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("Failed to read program from stdin")?;
        runtime.set_args("-", &[])?;
        runtime.exec_source("stdin", &source, &[])
    }

    /// Load a script, then run any tests it registered.
    fn run_script(&self, runtime: &LuaRuntime, path: &str, args: &[String]) -> Completion {
        let tests = &self.capabilities.tests;
        let before = match tests.registered(runtime) {
            Ok(count) => count,
            Err(err) => {
                log::debug!("Test autorun unavailable: {err:#}");
                usize::MAX
            }
        };

        let loaded = runtime
            .set_args(path, args)
            .and_then(|()| runtime.require_file(Path::new(path)));
        if let Err(err) = loaded {
            return Completion::from_error(err);
        }

        if before == usize::MAX {
            return Completion::Finished;
        }
        match tests.run_registered_since(runtime, before, args) {
            Ok(Some(passed)) => Completion::Reported(passed),
            Ok(None) => Completion::Finished,
            Err(err) => Completion::from_error(err),
        }
    }
}

impl Dispatch for StandardDispatch {
    fn prepare(&self, runtime: &LuaRuntime) -> Result<()> {
        self.capabilities.tests.install(runtime)
    }

    fn dispatch(&self, runtime: &LuaRuntime, request: &RequestContext) -> Completion {
        let kind = RequestKind::classify(&request.args);
        log::debug!("Dispatching {kind:?}");
        match kind {
            RequestKind::TestAtLine { args } => {
                Completion::from_report(self.capabilities.tests.run(runtime, &args))
            }
            RequestKind::Shell { args } => {
                Completion::from_result(self.capabilities.repl.run(runtime, &args))
            }
            RequestKind::InlineEval { code: None, .. } => {
                eprintln!("{MISSING_CODE_MESSAGE}");
                Completion::Exited(1)
            }
            RequestKind::InlineEval {
                code: Some(code),
                args,
            } => Completion::from_result(Self::run_inline(runtime, &code, &args)),
            RequestKind::Script { path, args } => self.run_script(runtime, &path, &args),
            RequestKind::Stdin => Completion::from_result(Self::run_stdin(runtime)),
        }
    }
}
