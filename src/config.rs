//! Configuration for the server and client.
//!
//! Both sides agree on the socket path; the server additionally reads its
//! preload list, debug mode, daemon flags, and stale-socket policy. Values
//! come from the environment (and the server's positional arguments) and are
//! fixed once the process starts serving.

use std::path::{Path, PathBuf};

/// Default socket file name, placed in the home directory.
pub const DEFAULT_SOCKET_NAME: &str = ".prefork_socket";

/// Environment variable names.
pub mod vars {
    /// Socket path override (tilde expanded).
    pub const SOCKET: &str = "PREFORK_SOCKET";
    /// Debug flag; the value `log` also lists loaded modules.
    pub const DEBUG: &str = "DEBUG";
    /// Run the server in the foreground.
    pub const NO_DAEMON: &str = "PREFORK_SERVER_NO_DAEMON";
    /// Keep the working directory when daemonizing.
    pub const DAEMON_NO_CHDIR: &str = "PREFORK_SERVER_DAEMON_NO_CHDIR";
    /// Keep stdout/stderr when daemonizing.
    pub const DAEMON_NO_REDIR_STDIO: &str = "PREFORK_SERVER_DAEMON_NO_REDIR_STDIO";
    /// Whitespace-separated modules preloaded before the server arguments.
    pub const AUTO_REQUIRE: &str = "PREFORK_SERVER_AUTO_REQUIRE";
    /// Colon-separated extra Lua module directories.
    pub const LUA_PATH: &str = "PREFORK_LUA_PATH";
    /// Remove a socket file nobody is listening on instead of failing.
    pub const REMOVE_STALE: &str = "PREFORK_SERVER_REMOVE_STALE";
    /// Route log output to this file.
    pub const LOG_FILE: &str = "PREFORK_LOG_FILE";
}

/// Server debug mode, from the `DEBUG` variable.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum DebugMode {
    /// No debug output.
    #[default]
    Off,
    /// Report takeover progress and log at debug level.
    On,
    /// Like `On`, and print the loaded module list after preloading.
    Log,
}

impl DebugMode {
    /// Parse the raw `DEBUG` value. Any set value enables debugging.
    pub fn from_value(value: Option<&str>) -> Self {
        match value {
            None => Self::Off,
            Some("log") => Self::Log,
            Some(_) => Self::On,
        }
    }

    /// Whether any debug output is enabled.
    pub fn enabled(self) -> bool {
        self != Self::Off
    }
}

/// How to detach when daemonizing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DaemonOptions {
    /// Keep the current working directory instead of changing to `/`.
    pub no_chdir: bool,
    /// Keep stdout/stderr instead of redirecting them to `/dev/null`.
    pub no_redirect_stdio: bool,
}

/// What to do when a socket file exists but nothing accepts on it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StalePolicy {
    /// Print a diagnostic and refuse to start.
    #[default]
    Fail,
    /// Delete the leftover file and start normally.
    Remove,
}

/// Server configuration. Built once at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerConfig {
    /// Path of the listening socket.
    pub socket_path: PathBuf,
    /// Modules or files named on the command line, preloaded in order.
    pub preload: Vec<String>,
    /// Modules preloaded before `preload`.
    pub auto_preload: Vec<String>,
    /// Debug mode.
    pub debug: DebugMode,
    /// `Some` when the server should detach.
    pub daemon: Option<DaemonOptions>,
    /// Extra Lua module directories searched by `require`.
    pub lua_path: Vec<PathBuf>,
    /// Stale socket handling during takeover.
    pub stale_policy: StalePolicy,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            socket_path: default_socket_path(),
            preload: Vec::new(),
            auto_preload: Vec::new(),
            debug: DebugMode::Off,
            daemon: Some(DaemonOptions::default()),
            lua_path: Vec::new(),
            stale_policy: StalePolicy::Fail,
        }
    }
}

impl ServerConfig {
    /// Build from the process environment and the server's arguments.
    pub fn load(args: Vec<String>) -> Self {
        let mut config = Self {
            preload: args,
            ..Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    /// Apply overrides from an arbitrary variable lookup.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(path) = lookup(vars::SOCKET) {
            self.socket_path = expand_path(&path);
        }
        self.debug = DebugMode::from_value(lookup(vars::DEBUG).as_deref());
        self.daemon = if lookup(vars::NO_DAEMON).is_some() {
            None
        } else {
            Some(DaemonOptions {
                no_chdir: lookup(vars::DAEMON_NO_CHDIR).is_some(),
                no_redirect_stdio: lookup(vars::DAEMON_NO_REDIR_STDIO).is_some(),
            })
        };
        if let Some(list) = lookup(vars::AUTO_REQUIRE) {
            self.auto_preload = list.split_whitespace().map(String::from).collect();
        }
        if let Some(dirs) = lookup(vars::LUA_PATH) {
            self.lua_path = dirs
                .split(':')
                .filter(|d| !d.is_empty())
                .map(expand_path)
                .collect();
        }
        if lookup(vars::REMOVE_STALE).is_some() {
            self.stale_policy = StalePolicy::Remove;
        }
    }

    /// Whether the server was only asked to stop a running instance.
    pub fn stop_only(&self) -> bool {
        self.preload.len() == 1 && self.preload[0] == crate::protocol::STOP_KEYWORD
    }

    /// Every entry to preload, auto-preload entries first.
    pub fn preload_entries(&self) -> impl Iterator<Item = &str> {
        self.auto_preload
            .iter()
            .chain(self.preload.iter())
            .map(String::as_str)
    }
}

/// Client configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    /// Path of the server socket.
    pub socket_path: PathBuf,
}

impl ClientConfig {
    /// Build from the process environment.
    pub fn load() -> Self {
        Self {
            socket_path: std::env::var(vars::SOCKET)
                .map(|p| expand_path(&p))
                .unwrap_or_else(|_| default_socket_path()),
        }
    }
}

/// `~/.prefork_socket`, or a relative fallback when there is no home.
pub fn default_socket_path() -> PathBuf {
    dirs::home_dir()
        .map(|home| home.join(DEFAULT_SOCKET_NAME))
        .unwrap_or_else(|| PathBuf::from(DEFAULT_SOCKET_NAME))
}

fn expand_path(raw: &str) -> PathBuf {
    Path::new(shellexpand::tilde(raw).as_ref()).to_path_buf()
}
