//! Lua primitive functions exposed to scripts.
//!
//! Primitives are registered when the Lua runtime is created, before any
//! module is preloaded, so preloaded code and request scripts see the same
//! globals.
//!
//! # Available Primitives
//!
//! - `log` - Logging functions (error, warn, info, debug, trace)
//! - `os.exit` - Exits the request instead of the worker process (`pcall` and
//!   `xpcall` re-raise it)
//!
//! # Adding New Primitives
//!
//! 1. Create a new module (e.g., `foo.rs`)
//! 2. Implement a `register(lua: &Lua) -> Result<()>` function
//! 3. Add `pub mod foo;` here
//! 4. Call `foo::register(lua)?;` in `register_all`

pub mod exit;
pub mod log;

use anyhow::Result;
use mlua::Lua;

pub use exit::{exit_request, lua_error, lua_exit_request, pending_exit, ExitRequest};

/// Register all primitive functions with the Lua state.
///
/// # Errors
///
/// Returns an error if any primitive registration fails.
pub fn register_all(lua: &Lua) -> Result<()> {
    log::register(lua)?;
    exit::register(lua)?;
    Ok(())
}
