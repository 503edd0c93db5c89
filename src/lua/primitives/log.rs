//! Logging primitive for Lua scripts.
//!
//! Exposes the `log` crate to preloaded modules and request scripts through a
//! global `log` table:
//!
//! ```lua
//! log.info("warming cache")
//! log.debug("loaded " .. name)
//! ```
//!
//! Messages use the `lua` target, so `RUST_LOG=lua=debug` filters them
//! separately from the server's own output.

use anyhow::{anyhow, Result};
use mlua::{Lua, Variadic};

/// Lua-visible level names and the `log` level each maps to.
const LEVELS: [(&str, log::Level); 5] = [
    ("error", log::Level::Error),
    ("warn", log::Level::Warn),
    ("info", log::Level::Info),
    ("debug", log::Level::Debug),
    ("trace", log::Level::Trace),
];

/// Register the global `log` table.
///
/// Each function accepts any number of values and joins them with spaces
/// after `tostring`, like `print`.
pub fn register(lua: &Lua) -> Result<()> {
    let log_table = lua
        .create_table()
        .map_err(|e| anyhow!("Failed to create log table: {e}"))?;

    for (name, level) in LEVELS {
        let func = lua
            .create_function(move |lua, values: Variadic<mlua::Value>| {
                if log::log_enabled!(target: "lua", level) {
                    let tostring: mlua::Function = lua.globals().get("tostring")?;
                    let parts = values
                        .iter()
                        .map(|v| tostring.call::<String>(v.clone()))
                        .collect::<mlua::Result<Vec<_>>>()?;
                    log::log!(target: "lua", level, "{}", parts.join(" "));
                }
                Ok(())
            })
            .map_err(|e| anyhow!("Failed to create log.{name} function: {e}"))?;
        log_table
            .set(name, func)
            .map_err(|e| anyhow!("Failed to set log.{name}: {e}"))?;
    }

    lua.globals()
        .set("log", log_table)
        .map_err(|e| anyhow!("Failed to register log table globally: {e}"))?;
    Ok(())
}
