//! Capabilities the dispatcher hands requests to.
//!
//! The worker only knows two narrow interfaces: [`TestRunner`] for
//! `test` / `file.lua:<line>` requests (and test autorun after a script), and
//! [`Repl`] for `repl` requests. [`Capabilities::default`] wires in the
//! built-in implementations; embedders can swap either one.

pub mod repl;
pub mod test_at_line;

use anyhow::Result;

use crate::lua::LuaRuntime;

pub use repl::LuaRepl;
pub use test_at_line::LineTestRunner;

/// Runs tests defined in Lua files.
pub trait TestRunner {
    /// Install test helpers into the runtime. Called once, before preloading.
    fn install(&self, runtime: &LuaRuntime) -> Result<()>;

    /// Run the tests selected by `args`. Returns whether every test passed.
    fn run(&self, runtime: &LuaRuntime, args: &[String]) -> Result<bool>;

    /// Number of tests registered so far.
    fn registered(&self, runtime: &LuaRuntime) -> Result<usize>;

    /// Run every test registered after the first `since` tests.
    ///
    /// Returns `None` when there are none, so a plain script keeps its own
    /// outcome.
    fn run_registered_since(
        &self,
        runtime: &LuaRuntime,
        since: usize,
        args: &[String],
    ) -> Result<Option<bool>>;
}

/// Interactive read-eval-print loop on the worker's standard streams.
pub trait Repl {
    /// Run a session until end of input or `exit`.
    fn run(&self, runtime: &LuaRuntime, args: &[String]) -> Result<()>;
}

/// The capability set a dispatcher works with.
pub struct Capabilities {
    /// Test runner.
    pub tests: Box<dyn TestRunner>,
    /// REPL.
    pub repl: Box<dyn Repl>,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            tests: Box::new(LineTestRunner::new()),
            repl: Box::new(LuaRepl::new()),
        }
    }
}

impl std::fmt::Debug for Capabilities {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Capabilities").finish_non_exhaustive()
    }
}
