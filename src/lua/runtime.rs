//! Lua runtime management.
//!
//! Provides the `LuaRuntime` struct which owns the interpreter state that the
//! server preloads and every worker inherits through `fork`. Handles module
//! search paths, preloading, request script execution, and the record of
//! which modules have been loaded.

use std::cell::RefCell;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::rc::Rc;

use anyhow::{anyhow, Context, Result};
use mlua::{Function, Lua, MultiValue, Table, Value, Variadic};

use super::primitives::{self, lua_error};

/// Loaded modules in completion order. Shared with the `require` wrapper.
type LoadedFeatures = Rc<RefCell<Vec<String>>>;

/// Lua scripting runtime for the prefork server.
///
/// Owns the Lua interpreter state. The state is not `Send`; the server
/// builds it on the main thread before forking, and each worker uses its own
/// copy-on-write image of it.
///
/// # Loaded features
///
/// `require` is wrapped so every module loaded through it (and every file
/// loaded with [`LuaRuntime::require_file`]) is recorded by resolved path.
/// The list backs the `DEBUG=log` output.
///
/// # Example
///
/// ```ignore
/// let lua = LuaRuntime::new()?;
/// lua.preload("app.boot")?;
/// lua.preload("./config/warm.lua")?;
/// lua.exec_source("-e", "print(app.version)", &[])?;
/// ```
pub struct LuaRuntime {
    /// The Lua interpreter state.
    lua: Lua,
    /// Extra directories prepended to `package.path`.
    search_path: Vec<PathBuf>,
    /// Modules loaded so far.
    loaded: LoadedFeatures,
}

impl std::fmt::Debug for LuaRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LuaRuntime")
            .field("search_path", &self.search_path)
            .field("loaded_count", &self.loaded.borrow().len())
            .finish_non_exhaustive()
    }
}

impl LuaRuntime {
    /// Create a runtime with the default module search path.
    pub fn new() -> Result<Self> {
        Self::with_search_path(&[])
    }

    /// Create a runtime that also searches `dirs` for modules.
    ///
    /// # Errors
    ///
    /// Returns an error if primitive registration or path setup fails.
    pub fn with_search_path(dirs: &[PathBuf]) -> Result<Self> {
        let lua = Lua::new();
        primitives::register_all(&lua)?;
        Self::setup_package_path(&lua, dirs)?;

        let loaded: LoadedFeatures = Rc::new(RefCell::new(Vec::new()));
        Self::track_require(&lua, &loaded)?;

        log::debug!("Lua runtime created (search path: {:?})", dirs);
        Ok(Self {
            lua,
            search_path: dirs.to_vec(),
            loaded,
        })
    }

    /// Prepend `{dir}/?.lua;{dir}/?/init.lua` for each directory.
    fn setup_package_path(lua: &Lua, dirs: &[PathBuf]) -> Result<()> {
        if dirs.is_empty() {
            return Ok(());
        }
        let package: Table = lua
            .globals()
            .get("package")
            .map_err(|e| anyhow!("Failed to get package table: {e}"))?;
        let current_path: String = package
            .get("path")
            .map_err(|e| anyhow!("Failed to get package.path: {e}"))?;

        let mut entries: Vec<String> = dirs
            .iter()
            .map(|dir| {
                format!(
                    "{path}/?.lua;{path}/?/init.lua",
                    path = dir.display()
                )
            })
            .collect();
        entries.push(current_path);

        package
            .set("path", entries.join(";"))
            .map_err(|e| anyhow!("Failed to set package.path: {e}"))?;
        Ok(())
    }

    /// Wrap the global `require` so newly loaded modules are recorded.
    fn track_require(lua: &Lua, loaded: &LoadedFeatures) -> Result<()> {
        let globals = lua.globals();
        let original: Function = globals
            .get("require")
            .map_err(|e| anyhow!("Failed to get require: {e}"))?;
        let package: Table = globals
            .get("package")
            .map_err(|e| anyhow!("Failed to get package table: {e}"))?;
        let features = Rc::clone(loaded);

        let tracked = lua
            .create_function(move |_, name: String| {
                let already: Table = package.get("loaded")?;
                let fresh = !already.contains_key(name.as_str())?;
                let result: MultiValue = original.call(name.as_str())?;
                if fresh {
                    let searchpath: Function = package.get("searchpath")?;
                    let path: String = package.get("path")?;
                    let resolved: Option<String> = searchpath.call((name.as_str(), path))?;
                    features.borrow_mut().push(resolved.unwrap_or(name));
                }
                Ok(result)
            })
            .map_err(|e| anyhow!("Failed to create require wrapper: {e}"))?;
        globals
            .set("require", tracked)
            .map_err(|e| anyhow!("Failed to install require wrapper: {e}"))?;
        Ok(())
    }

    /// The underlying Lua state.
    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    /// Load one preload entry.
    ///
    /// Entries that look like paths (contain `/` or end in `.lua`) are
    /// loaded as files; anything else is a module name for `require`.
    pub fn preload(&self, entry: &str) -> Result<()> {
        if looks_like_path(entry) {
            self.require_file(Path::new(entry))?;
        } else {
            self.require(entry)?;
        }
        Ok(())
    }

    /// `require(name)` through the tracked wrapper.
    pub fn require(&self, name: &str) -> Result<()> {
        let require: Function = self
            .lua
            .globals()
            .get("require")
            .map_err(|e| anyhow!("Failed to get require: {e}"))?;
        require
            .call::<MultiValue>(name)
            .map_err(|e| lua_error(e, format!("Failed to require {name}")))?;
        Ok(())
    }

    /// Load a Lua file once, keyed by its absolute path in `package.loaded`.
    ///
    /// Returns `false` without running anything when the file was already
    /// loaded (for example by the server's preload).
    pub fn require_file(&self, path: &Path) -> Result<bool> {
        let absolute = std::fs::canonicalize(path)
            .with_context(|| format!("cannot load such file -- {}", path.display()))?;
        let key = absolute.to_string_lossy().into_owned();

        let loaded = self.package_loaded()?;
        if loaded
            .contains_key(key.as_str())
            .map_err(|e| anyhow!("Failed to query package.loaded: {e}"))?
        {
            log::debug!("Already loaded: {key}");
            return Ok(false);
        }

        let mut source = std::fs::read_to_string(&absolute)
            .with_context(|| format!("Failed to read Lua file: {key}"))?;
        if source.starts_with('#') {
            // Comment out a shebang line, keeping line numbers intact.
            source.insert_str(0, "--");
        }

        let value: Value = self
            .lua
            .load(source.as_str())
            .set_name(format!("@{key}"))
            .eval()
            .map_err(|e| lua_error(e, format!("Failed to execute Lua file {key}")))?;
        let value = if value.is_nil() { Value::Boolean(true) } else { value };
        loaded
            .set(key.as_str(), value)
            .map_err(|e| anyhow!("Failed to record {key} in package.loaded: {e}"))?;

        self.loaded.borrow_mut().push(key.clone());
        log::debug!("Loaded Lua file: {key}");
        Ok(true)
    }

    /// Execute a chunk of source, passing `args` as its varargs.
    pub fn exec_source(&self, name: &str, source: &str, args: &[String]) -> Result<()> {
        self.lua
            .load(source)
            .set_name(format!("={name}"))
            .call::<()>(args.iter().cloned().collect::<Variadic<String>>())
            .map_err(|e| lua_error(e, format!("Failed to execute Lua {name}")))?;
        log::debug!("Executed Lua: {name}");
        Ok(())
    }

    /// Set the global `arg` table: `arg[0]` is the script, then its arguments.
    pub fn set_args(&self, script: &str, args: &[String]) -> Result<()> {
        let table = self
            .lua
            .create_table()
            .map_err(|e| anyhow!("Failed to create arg table: {e}"))?;
        table
            .set(0, script)
            .map_err(|e| anyhow!("Failed to set arg[0]: {e}"))?;
        for (i, arg) in args.iter().enumerate() {
            table
                .set(i + 1, arg.as_str())
                .map_err(|e| anyhow!("Failed to set arg[{}]: {e}", i + 1))?;
        }
        self.lua
            .globals()
            .set("arg", table)
            .map_err(|e| anyhow!("Failed to set arg: {e}"))?;
        Ok(())
    }

    /// Exit code from an `os.exit` call made during this request, if any.
    ///
    /// Set even when the script caught the unwinding error (for example
    /// inside a coroutine), so the worker can still honor it.
    pub fn exit_requested(&self) -> Option<i32> {
        primitives::pending_exit(&self.lua)
    }

    /// Modules loaded so far, in load order.
    pub fn loaded_features(&self) -> Vec<String> {
        self.loaded.borrow().clone()
    }

    /// Write the loaded module list, one per line.
    pub fn print_loaded_features<W: Write>(&self, out: &mut W) -> io::Result<()> {
        for feature in self.loaded.borrow().iter() {
            writeln!(out, "{feature}")?;
        }
        out.flush()
    }

    fn package_loaded(&self) -> Result<Table> {
        let package: Table = self
            .lua
            .globals()
            .get("package")
            .map_err(|e| anyhow!("Failed to get package table: {e}"))?;
        package
            .get("loaded")
            .map_err(|e| anyhow!("Failed to get package.loaded: {e}"))
    }
}

/// Whether a preload entry names a file rather than a module.
pub fn looks_like_path(entry: &str) -> bool {
    entry.contains('/') || entry.ends_with(".lua")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lua::primitives::exit_request;

    fn fixture_dir() -> tempfile::TempDir {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::write(
            dir.path().join("counter.lua"),
            "LOADS = (LOADS or 0) + 1\nreturn { value = 41 }\n",
        )
        .expect("write module");
        std::fs::create_dir(dir.path().join("pkg")).expect("mkdir");
        std::fs::write(dir.path().join("pkg").join("init.lua"), "PKG = true\n")
            .expect("write package");
        dir
    }

    #[test]
    fn test_runtime_creation() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        assert!(lua.loaded_features().is_empty());
        let _: Table = lua.lua().globals().get("log").expect("log primitive");
    }

    #[test]
    fn test_require_uses_search_path_and_records_feature() {
        let dir = fixture_dir();
        let lua = LuaRuntime::with_search_path(&[dir.path().to_path_buf()])
            .expect("Should create runtime");

        lua.preload("counter").expect("preload module");
        lua.preload("pkg").expect("preload package");
        lua.require("counter").expect("second require");

        let loads: i64 = lua.lua().globals().get("LOADS").expect("LOADS");
        assert_eq!(loads, 1);
        let features = lua.loaded_features();
        assert_eq!(features.len(), 2);
        assert!(features[0].ends_with("counter.lua"));
        assert!(features[1].ends_with("init.lua"));
    }

    #[test]
    fn test_require_file_runs_once() {
        let dir = fixture_dir();
        let lua = LuaRuntime::new().expect("Should create runtime");
        let path = dir.path().join("counter.lua");

        assert!(lua.require_file(&path).expect("first load"));
        assert!(!lua.require_file(&path).expect("second load"));

        let loads: i64 = lua.lua().globals().get("LOADS").expect("LOADS");
        assert_eq!(loads, 1);

        let mut out = Vec::new();
        lua.print_loaded_features(&mut out).expect("print");
        let listing = String::from_utf8(out).expect("utf8");
        assert!(listing.trim_end().ends_with("counter.lua"));
    }

    #[test]
    fn test_require_file_missing() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        let err = lua
            .require_file(Path::new("/nonexistent/prefork/file.lua"))
            .unwrap_err();
        assert!(err.to_string().contains("cannot load such file"));
    }

    #[test]
    fn test_require_file_skips_shebang() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("script.lua");
        std::fs::write(&path, "#!/usr/bin/env lua\nSHEBANG_OK = true\n").expect("write");

        let lua = LuaRuntime::new().expect("Should create runtime");
        lua.require_file(&path).expect("load script");
        let ok: bool = lua.lua().globals().get("SHEBANG_OK").expect("global");
        assert!(ok);
    }

    #[test]
    fn test_exec_source_receives_varargs_and_arg() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        let args = vec!["a".to_string(), "b".to_string()];
        lua.set_args("-e", &args).expect("set args");
        lua.exec_source("-e", "local x, y = ...; JOINED = x .. y .. arg[2] .. arg[0]", &args)
            .expect("exec");
        let joined: String = lua.lua().globals().get("JOINED").expect("global");
        assert_eq!(joined, "abb-e");
    }

    #[test]
    fn test_exec_source_surfaces_exit_request() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        let err = lua.exec_source("-e", "os.exit(4)", &[]).unwrap_err();
        assert_eq!(exit_request(&err), Some(4));
    }

    #[test]
    fn test_exec_source_exit_inside_pcall() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        let err = lua
            .exec_source("-e", "pcall(os.exit, 3); AFTER = true", &[])
            .unwrap_err();
        assert_eq!(exit_request(&err), Some(3));
        assert_eq!(lua.exit_requested(), Some(3));
        let after: Option<bool> = lua.lua().globals().get("AFTER").expect("global");
        assert_eq!(after, None);
    }

    #[test]
    fn test_exec_source_error_names_chunk() {
        let lua = LuaRuntime::new().expect("Should create runtime");
        let err = lua.exec_source("-e", "error('boom')", &[]).unwrap_err();
        let message = err.to_string();
        assert!(message.starts_with("Failed to execute Lua -e: "), "{message}");
        assert!(message.contains("boom"), "{message}");
        assert_eq!(exit_request(&err), None);
        assert_eq!(lua.exit_requested(), None);
    }

    #[test]
    fn test_require_file_surfaces_exit_request() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("quits.lua");
        std::fs::write(&path, "os.exit(6)\n").expect("write");

        let lua = LuaRuntime::new().expect("Should create runtime");
        let err = lua.require_file(&path).unwrap_err();
        assert_eq!(exit_request(&err), Some(6));
    }

    #[test]
    fn test_looks_like_path() {
        assert!(looks_like_path("./app.lua"));
        assert!(looks_like_path("lib/app"));
        assert!(looks_like_path("app.lua"));
        assert!(!looks_like_path("app.boot"));
    }
}
