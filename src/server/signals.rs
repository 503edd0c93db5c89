//! Signals as messages.
//!
//! SIGQUIT, SIGTERM, and SIGCHLD are routed into self-pipes with
//! `signal_hook::low_level::pipe`. The accept loop polls the read ends next
//! to the listening socket and sees each signal as a [`Control`] value; the
//! handlers themselves only write one byte and never block.

use std::io::{self, Read};
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};
use signal_hook::consts::signal::{SIGCHLD, SIGQUIT, SIGTERM};

use crate::process::SavedDispositions;

/// What the accept loop was asked to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Control {
    /// SIGQUIT: stop accepting, keep the socket file for a successor.
    Stop,
    /// SIGTERM: remove the socket file, then stop accepting.
    Shutdown,
    /// SIGCHLD: reap finished workers.
    ChildExited,
}

impl Control {
    const ALL: [(libc::c_int, Control); 3] = [
        (SIGQUIT, Control::Stop),
        (SIGTERM, Control::Shutdown),
        (SIGCHLD, Control::ChildExited),
    ];
}

/// Read ends of the signal pipes, plus what to restore in workers.
pub struct ControlChannel {
    pipes: Vec<(Control, UnixStream)>,
    saved: SavedDispositions,
}

impl std::fmt::Debug for ControlChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let controls: Vec<Control> = self.pipes.iter().map(|(c, _)| *c).collect();
        f.debug_struct("ControlChannel")
            .field("controls", &controls)
            .field("saved", &self.saved)
            .finish()
    }
}

impl ControlChannel {
    /// Capture the current dispositions, then route the signals to pipes.
    pub fn install() -> Result<Self> {
        let signals: Vec<libc::c_int> = Control::ALL.iter().map(|(sig, _)| *sig).collect();
        let saved =
            SavedDispositions::capture(&signals).context("Failed to read signal dispositions")?;

        let mut pipes = Vec::with_capacity(Control::ALL.len());
        for (signal, control) in Control::ALL {
            let (read, write) = UnixStream::pair().context("Failed to create signal pipe")?;
            read.set_nonblocking(true)?;
            write.set_nonblocking(true)?;
            signal_hook::low_level::pipe::register(signal, write)
                .with_context(|| format!("Failed to register handler for signal {signal}"))?;
            pipes.push((control, read));
        }
        log::debug!("Signal handlers installed");
        Ok(Self { pipes, saved })
    }

    /// Descriptors to poll, in the same order as [`ControlChannel::control_at`].
    pub fn fds(&self) -> impl Iterator<Item = RawFd> + '_ {
        self.pipes.iter().map(|(_, pipe)| pipe.as_raw_fd())
    }

    /// Drain the pipe at `index` and return its control if a signal arrived.
    pub fn control_at(&self, index: usize) -> Option<Control> {
        let (control, pipe) = self.pipes.get(index)?;
        let mut buf = [0u8; 64];
        let mut seen = false;
        loop {
            match (&*pipe).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => seen = true,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        seen.then_some(*control)
    }

    /// Give the signals back their pre-server behaviour in a forked worker.
    pub fn release_in_worker(self) -> io::Result<()> {
        self.saved.restore()
    }
}
