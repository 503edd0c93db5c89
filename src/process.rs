//! Process-level plumbing for the server and its workers.
//!
//! Thin wrappers over `fork`, `dup2`, `umask`, `sigaction`, and `waitpid`.
//! Everything here changes state of the *calling* process only; after a fork
//! that is exactly what a worker wants, since its environment, cwd, and
//! standard streams are private copies.

// Rust guideline compliant 2026-02

use std::ffi::OsString;
use std::io::{self, Write};
use std::os::fd::{AsRawFd, IntoRawFd, OwnedFd};

use anyhow::{Context, Result};
use scopeguard::ScopeGuard;

/// Which side of a fork the caller is on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Fork {
    /// The original process; carries the child's pid.
    Parent(libc::pid_t),
    /// The new process.
    Child,
}

/// Fork the current process.
///
/// Buffered output is flushed first so the child does not inherit (and
/// later repeat) bytes the parent already wrote.
pub fn fork() -> io::Result<Fork> {
    flush_stdio();
    // SAFETY: the server is single-threaded when it forks, so the child
    // does not inherit locks held by other threads.
    match unsafe { libc::fork() } {
        -1 => Err(io::Error::last_os_error()),
        0 => Ok(Fork::Child),
        pid => Ok(Fork::Parent(pid)),
    }
}

/// Flush Rust's and C's standard output buffers.
///
/// Lua writes through C stdio, so both layers need flushing before the
/// process forks, reports a status, or exits.
pub fn flush_stdio() {
    let _ = io::stdout().flush();
    let _ = io::stderr().flush();
    // SAFETY: fflush(NULL) flushes every open C stream.
    unsafe {
        libc::fflush(std::ptr::null_mut());
    }
}

/// Set a restrictive umask until the returned guard drops.
pub fn restrictive_umask(
    mask: libc::mode_t,
) -> ScopeGuard<libc::mode_t, impl FnOnce(libc::mode_t)> {
    // SAFETY: umask only swaps the process file creation mask.
    let old = unsafe { libc::umask(mask) };
    scopeguard::guard(old, |old| {
        // SAFETY: see above.
        unsafe {
            libc::umask(old);
        }
    })
}

/// Current process umask.
pub fn current_umask() -> libc::mode_t {
    // SAFETY: umask has no failure mode; the original value is put back.
    unsafe {
        let mask = libc::umask(0o022);
        libc::umask(mask);
        mask
    }
}

/// Replace fds 0, 1, and 2 with the given descriptors.
///
/// The passed descriptors are closed afterwards; the standard fds keep the
/// duplicated open file descriptions.
pub fn replace_stdio(fds: [OwnedFd; 3]) -> Result<()> {
    flush_stdio();
    for (target, fd) in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO]
        .into_iter()
        .zip(fds)
    {
        if fd.as_raw_fd() == target {
            // Already in place; dropping it would close the target.
            let _ = fd.into_raw_fd();
            continue;
        }
        // SAFETY: both descriptors are open; dup2 atomically replaces target.
        if unsafe { libc::dup2(fd.as_raw_fd(), target) } < 0 {
            return Err(io::Error::last_os_error())
                .with_context(|| format!("Failed to replace fd {target}"));
        }
    }
    Ok(())
}

/// Replace the whole process environment with `vars`.
pub fn replace_env(vars: &[(OsString, OsString)]) {
    let existing: Vec<OsString> = std::env::vars_os().map(|(key, _)| key).collect();
    for key in existing {
        std::env::remove_var(key);
    }
    for (key, value) in vars {
        std::env::set_var(key, value);
    }
    log::debug!("Environment replaced ({} variables)", vars.len());
}

/// Reap every child that has already exited. Never blocks.
pub fn reap_children() -> usize {
    let mut reaped = 0;
    loop {
        let mut status: libc::c_int = 0;
        // SAFETY: WNOHANG makes this a non-blocking status query.
        let pid = unsafe { libc::waitpid(-1, &mut status, libc::WNOHANG) };
        if pid <= 0 {
            return reaped;
        }
        log::debug!("Reaped worker {pid} (status {status})");
        reaped += 1;
    }
}

/// Send `signal` to `pid`.
pub fn send_signal(pid: libc::pid_t, signal: libc::c_int) -> io::Result<()> {
    // SAFETY: kill has no memory-safety preconditions.
    if unsafe { libc::kill(pid, signal) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Signal dispositions captured before the server installs its handlers.
///
/// A forked worker restores these so it reacts to QUIT and TERM like an
/// ordinary process instead of running the server's handlers.
pub struct SavedDispositions {
    saved: Vec<(libc::c_int, libc::sigaction)>,
}

impl std::fmt::Debug for SavedDispositions {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let signals: Vec<libc::c_int> = self.saved.iter().map(|(sig, _)| *sig).collect();
        f.debug_struct("SavedDispositions")
            .field("signals", &signals)
            .finish()
    }
}

impl SavedDispositions {
    /// Capture the current dispositions of `signals`.
    pub fn capture(signals: &[libc::c_int]) -> io::Result<Self> {
        let mut saved = Vec::with_capacity(signals.len());
        for &signal in signals {
            // SAFETY: sigaction is a plain C struct; zeroed is valid.
            let mut old: libc::sigaction = unsafe { std::mem::zeroed() };
            // SAFETY: a null new action only queries the current one.
            if unsafe { libc::sigaction(signal, std::ptr::null(), &mut old) } != 0 {
                return Err(io::Error::last_os_error());
            }
            saved.push((signal, old));
        }
        Ok(Self { saved })
    }

    /// Reinstall the captured dispositions.
    pub fn restore(&self) -> io::Result<()> {
        for (signal, action) in &self.saved {
            // SAFETY: action was produced by sigaction for this signal.
            if unsafe { libc::sigaction(*signal, action, std::ptr::null_mut()) } != 0 {
                return Err(io::Error::last_os_error());
            }
        }
        Ok(())
    }
}
