//! `os.exit` for code running inside a worker.
//!
//! The stock `os.exit` would terminate the worker on the spot, skipping the
//! status report the client is waiting for. The replacement records an
//! [`ExitRequest`] on the Lua state and raises it as an error; it unwinds out
//! of the script and the dispatcher turns it into the worker's exit code.
//! `pcall` and `xpcall` re-raise a recorded request, so a protected call
//! cannot swallow the exit.

use std::fmt;

use anyhow::{anyhow, Result};
use mlua::{Function, Lua, Value};

/// Re-raise a recorded exit after every protected call. The chunk receives
/// the Rust `rethrow` function as its only argument.
const GUARD_PROTECTED_CALLS: &str = r#"
local raw_pcall, raw_xpcall, rethrow = pcall, xpcall, ...

local function settle(...)
  rethrow()
  return ...
end

function pcall(...)
  return settle(raw_pcall(...))
end

function xpcall(...)
  return settle(raw_xpcall(...))
end
"#;

/// A script asked to exit with this code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitRequest(pub i32);

impl fmt::Display for ExitRequest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exit({})", self.0)
    }
}

impl std::error::Error for ExitRequest {}

/// Exit code for an `os.exit` argument: `true`/`nil` is 0, `false` is 1.
fn exit_code(value: &Value) -> i32 {
    match value {
        Value::Boolean(false) => 1,
        Value::Integer(code) => (*code).clamp(i64::from(i32::MIN), i64::from(i32::MAX)) as i32,
        Value::Number(code) => *code as i32,
        _ => 0,
    }
}

/// Replace `os.exit` with the unwinding version and guard `pcall`/`xpcall`.
pub fn register(lua: &Lua) -> Result<()> {
    let os: mlua::Table = lua
        .globals()
        .get("os")
        .map_err(|e| anyhow!("Failed to get os table: {e}"))?;
    let exit_fn = lua
        .create_function(|lua, code: Option<Value>| {
            let code = match pending_exit(lua) {
                Some(first) => first,
                None => {
                    let code = code.as_ref().map_or(0, exit_code);
                    lua.set_app_data(ExitRequest(code));
                    code
                }
            };
            Err::<(), _>(raise(code))
        })
        .map_err(|e| anyhow!("Failed to create os.exit function: {e}"))?;
    os.set("exit", exit_fn)
        .map_err(|e| anyhow!("Failed to set os.exit: {e}"))?;

    let rethrow: Function = lua
        .create_function(|lua, ()| match pending_exit(lua) {
            Some(code) => Err(raise(code)),
            None => Ok(()),
        })
        .map_err(|e| anyhow!("Failed to create exit rethrow function: {e}"))?;
    lua.load(GUARD_PROTECTED_CALLS)
        .set_name("=exit_guard")
        .call::<()>(rethrow)
        .map_err(|e| anyhow!("Failed to guard protected calls: {e}"))?;
    Ok(())
}

fn raise(code: i32) -> mlua::Error {
    mlua::Error::external(ExitRequest(code))
}

/// The exit a script asked for, even if the error it raised was caught.
///
/// The first request wins; later `os.exit` calls re-raise it.
pub fn pending_exit(lua: &Lua) -> Option<i32> {
    lua.app_data_ref::<ExitRequest>().map(|request| request.0)
}

/// Convert a Lua error into an `anyhow` error with `context`.
///
/// An exit request stays an [`ExitRequest`] so [`exit_request`] still finds
/// it; anything else is flattened into a message.
pub fn lua_error(err: mlua::Error, context: impl fmt::Display) -> anyhow::Error {
    match lua_exit_request(&err) {
        Some(code) => anyhow::Error::new(ExitRequest(code)),
        None => anyhow!("{context}: {err}"),
    }
}

/// Find an exit request anywhere in an error chain.
pub fn exit_request(err: &anyhow::Error) -> Option<i32> {
    err.chain()
        .find_map(|cause| cause.downcast_ref::<ExitRequest>().map(|request| request.0))
}

/// Find an exit request inside a Lua error.
pub fn lua_exit_request(err: &mlua::Error) -> Option<i32> {
    match err {
        mlua::Error::CallbackError { cause, .. } | mlua::Error::WithContext { cause, .. } => {
            lua_exit_request(cause)
        }
        mlua::Error::ExternalError(inner) => {
            inner.downcast_ref::<ExitRequest>().map(|request| request.0)
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run(source: &str) -> anyhow::Result<()> {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        lua.load(source)
            .exec()
            .map_err(|e| lua_error(e, "running chunk"))
    }

    #[test]
    fn test_exit_codes() {
        for (source, expected) in [
            ("os.exit()", 0),
            ("os.exit(true)", 0),
            ("os.exit(false)", 1),
            ("os.exit(3)", 3),
            ("local function f() os.exit(7) end f()", 7),
        ] {
            let err = run(source).unwrap_err();
            assert_eq!(exit_request(&err), Some(expected), "{source}");
        }
    }

    #[test]
    fn test_plain_error_is_not_exit() {
        let err = run("error('boom')").unwrap_err();
        assert_eq!(exit_request(&err), None);
        assert!(format!("{err:#}").contains("boom"));
    }

    #[test]
    fn test_code_after_exit_does_not_run() {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        let _ = lua.load("reached = false; os.exit(0); reached = true").exec();
        let reached: bool = lua.globals().get("reached").expect("global");
        assert!(!reached);
    }

    #[test]
    fn test_plain_error_keeps_context() {
        let err = run("error('boom')").unwrap_err();
        assert!(err.to_string().starts_with("running chunk: "), "{err}");
    }

    #[test]
    fn test_large_codes_saturate() {
        let err = run("os.exit(4294967296)").unwrap_err();
        assert_eq!(exit_request(&err), Some(i32::MAX));
    }

    #[test]
    fn test_pcall_cannot_swallow_exit() {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        let err = lua
            .load("pcall(os.exit, 3); AFTER = true")
            .exec()
            .map_err(|e| lua_error(e, "running chunk"))
            .unwrap_err();
        assert_eq!(exit_request(&err), Some(3));
        assert_eq!(pending_exit(&lua), Some(3));
        let after: Option<bool> = lua.globals().get("AFTER").expect("global");
        assert_eq!(after, None);
    }

    #[test]
    fn test_xpcall_cannot_swallow_exit() {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        let result = lua
            .load("xpcall(function() os.exit(false) end, function(e) return e end); AFTER = true")
            .exec();
        let err = result.map_err(|e| lua_error(e, "running chunk")).unwrap_err();
        assert_eq!(exit_request(&err), Some(1));
        let after: Option<bool> = lua.globals().get("AFTER").expect("global");
        assert_eq!(after, None);
    }

    #[test]
    fn test_first_exit_wins() {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        let _ = lua
            .load("coroutine.resume(coroutine.create(function() os.exit(5) end)); os.exit(0)")
            .exec();
        assert_eq!(pending_exit(&lua), Some(5));
    }

    #[test]
    fn test_protected_calls_still_return_values() {
        let lua = Lua::new();
        register(&lua).expect("Should register os.exit");
        let (ok, value): (bool, i64) = lua
            .load("return pcall(function(a, b) return a + b end, 2, 3)")
            .eval()
            .expect("eval");
        assert!(ok);
        assert_eq!(value, 5);
        let (ok, message): (bool, String) = lua
            .load("return pcall(error, 'boom', 0)")
            .eval()
            .expect("eval");
        assert!(!ok);
        assert_eq!(message, "boom");
        assert_eq!(pending_exit(&lua), None);
    }
}
