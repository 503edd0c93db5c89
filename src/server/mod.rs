//! The preloading fork server.
//!
//! # Lifecycle
//!
//! ```text
//! take_over(old server) ──► stop only? ──yes──► exit 0
//!                               │ no
//!                               ▼
//!                   preload modules into LuaRuntime
//!                               │
//!               bind socket (umask 077, then chmod 600)
//!                               │
//!                   daemonize (unless disabled)
//!                               │
//!                  install signal control channel
//!                               │
//!            ┌──────────── accept loop (poll) ◄───────────┐
//!            │                  │ connection               │
//!            │                fork ── parent: close conn ──┘
//!            │                  │ child
//!            │                Worker::run ─► exit
//!            │
//!            ├─ SIGQUIT (Stop):     close listener, keep socket file
//!            ├─ SIGTERM (Shutdown): remove socket file, close listener
//!            └─ SIGCHLD:            reap workers
//! ```

// Rust guideline compliant 2026-02

pub mod signals;
pub mod takeover;

use std::fs;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::net::{UnixListener, UnixStream};

use anyhow::{anyhow, Context, Result};

use crate::config::{DaemonOptions, DebugMode, ServerConfig};
use crate::lua::LuaRuntime;
use crate::process::{self, Fork};
use crate::runners::Capabilities;
use crate::worker::{Dispatch, StandardDispatch, Worker};

pub use signals::{Control, ControlChannel};

/// A configured, not yet running, server.
pub struct Server {
    config: ServerConfig,
    dispatcher: Box<dyn Dispatch>,
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Server {
    /// Server with the standard dispatcher and built-in capabilities.
    pub fn new(config: ServerConfig) -> Self {
        Self::with_capabilities(config, Capabilities::default())
    }

    /// Server with the standard dispatcher and the given capabilities.
    pub fn with_capabilities(config: ServerConfig, capabilities: Capabilities) -> Self {
        Self::with_dispatcher(config, StandardDispatch::new(capabilities))
    }

    /// Server with a custom dispatcher replacing the argument handling.
    pub fn with_dispatcher<D: Dispatch + 'static>(config: ServerConfig, dispatcher: D) -> Self {
        Self {
            config,
            dispatcher: Box::new(dispatcher),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// Run until stopped. Returns once the accept loop has ended.
    ///
    /// # Errors
    ///
    /// Fails when a previous server cannot be stopped, a preload fails, or
    /// the socket cannot be bound. No socket is bound in those cases.
    pub fn run(self) -> Result<()> {
        takeover::take_over(&self.config)?;
        if self.config.stop_only() {
            log::debug!("Stop requested, not starting a new server");
            return Ok(());
        }

        let runtime = LuaRuntime::with_search_path(&self.config.lua_path)?;
        self.dispatcher.prepare(&runtime)?;
        self.preload(&runtime)?;

        let listener = self.bind()?;
        if let Some(options) = self.config.daemon {
            daemonize(options)?;
        }
        let control = ControlChannel::install()?;

        log::info!(
            "prefork-server {} serving {} (pid {})",
            env!("CARGO_PKG_VERSION"),
            self.config.socket_path.display(),
            std::process::id()
        );
        self.accept_loop(&runtime, listener, control)
    }

    fn preload(&self, runtime: &LuaRuntime) -> Result<()> {
        for entry in self.config.preload_entries() {
            runtime
                .preload(entry)
                .with_context(|| format!("Error preloading {entry}"))?;
            log::debug!("Preloaded {entry}");
        }
        if self.config.debug == DebugMode::Log {
            runtime.print_loaded_features(&mut io::stdout().lock())?;
        }
        Ok(())
    }

    /// Bind under a restrictive umask so nobody can connect before the
    /// permissions are tightened.
    fn bind(&self) -> Result<UnixListener> {
        let path = &self.config.socket_path;
        let listener = {
            let _umask = process::restrictive_umask(0o077);
            UnixListener::bind(path)
                .with_context(|| format!("Failed to bind socket at {}", path.display()))?
        };
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .with_context(|| format!("Failed to set permissions on {}", path.display()))?;
        listener.set_nonblocking(true)?;
        log::debug!("Bound {}", path.display());
        Ok(listener)
    }

    fn accept_loop(
        &self,
        runtime: &LuaRuntime,
        listener: UnixListener,
        control: ControlChannel,
    ) -> Result<()> {
        let mut control = Some(control);
        let mut listener = Some(listener);

        while let (Some(channel), Some(socket)) = (control.as_ref(), listener.as_ref()) {
            let mut fds: Vec<libc::pollfd> = std::iter::once(socket.as_raw_fd())
                .chain(channel.fds())
                .map(|fd| libc::pollfd {
                    fd,
                    events: libc::POLLIN,
                    revents: 0,
                })
                .collect();

            // SAFETY: fds is a valid, initialised pollfd array of this length.
            let ready = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, -1) };
            if ready < 0 {
                let err = io::Error::last_os_error();
                if err.kind() == io::ErrorKind::Interrupted {
                    continue;
                }
                return Err(err).context("poll failed");
            }

            // Signals first: a pending Stop wins over a pending connection.
            for (index, pollfd) in fds.iter().enumerate().skip(1) {
                if pollfd.revents & libc::POLLIN == 0 {
                    continue;
                }
                match channel.control_at(index - 1) {
                    Some(Control::Stop) => {
                        log::info!("SIGQUIT received, no longer accepting clients");
                        listener = None;
                    }
                    Some(Control::Shutdown) => {
                        log::info!("SIGTERM received, removing socket and shutting down");
                        takeover::remove_socket_file(&self.config.socket_path)?;
                        listener = None;
                    }
                    Some(Control::ChildExited) => {
                        process::reap_children();
                    }
                    None => {}
                }
            }
            let Some(socket) = listener.as_ref() else {
                break;
            };
            if fds[0].revents & (libc::POLLERR | libc::POLLHUP | libc::POLLNVAL) != 0 {
                log::debug!("Listening socket reported an error, leaving accept loop");
                break;
            }
            if fds[0].revents & libc::POLLIN == 0 {
                continue;
            }

            match socket.accept() {
                Ok((stream, _)) => {
                    stream.set_nonblocking(false)?;
                    let child = self.fork_worker(runtime, stream, &mut listener, &mut control);
                    if let Some(code) = child {
                        process::flush_stdio();
                        std::process::exit(code);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    log::debug!("Accept failed, leaving accept loop: {e}");
                    break;
                }
            }
        }

        log::info!("Accept loop finished");
        Ok(())
    }

    /// Fork a worker for `stream`.
    ///
    /// Returns `Some(exit_code)` in the child once the worker is done; the
    /// parent gets `None` and its copy of the connection is closed.
    fn fork_worker(
        &self,
        runtime: &LuaRuntime,
        stream: UnixStream,
        listener: &mut Option<UnixListener>,
        control: &mut Option<ControlChannel>,
    ) -> Option<i32> {
        let server_pid = std::process::id() as libc::pid_t;
        match process::fork() {
            Ok(Fork::Child) => {
                *listener = None;
                if let Some(channel) = control.take() {
                    if let Err(e) = channel.release_in_worker() {
                        log::warn!("Failed to restore signal dispositions: {e}");
                    }
                }
                let worker = Worker::new(runtime, self.dispatcher.as_ref(), server_pid);
                Some(worker.run(stream))
            }
            Ok(Fork::Parent(pid)) => {
                log::debug!("Forked worker {pid}");
                drop(stream);
                None
            }
            Err(e) => {
                log::error!("Failed to fork worker: {e}");
                None
            }
        }
    }
}

/// Detach from the terminal, keeping the current umask.
fn daemonize(options: DaemonOptions) -> Result<()> {
    let mut daemon = daemonize::Daemonize::new().umask(process::current_umask());
    if options.no_chdir {
        daemon = daemon.working_directory(std::env::current_dir()?);
    }
    if options.no_redirect_stdio {
        daemon = daemon
            .stdout(daemonize::Stdio::keep())
            .stderr(daemonize::Stdio::keep());
    }
    daemon
        .start()
        .map_err(|e| anyhow!("Failed to daemonize: {e}"))?;
    log::debug!("Daemonized as pid {}", std::process::id());
    Ok(())
}
