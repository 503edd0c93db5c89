//! Taking over the socket path from a previous server.
//!
//! A new server talks to the old one exactly like a client would, except
//! that its directory line is `stop`. The old server's worker then sends
//! SIGQUIT to its parent, reports, and closes; the old server stops
//! accepting and leaves the socket file for us to remove and rebind.

use std::fs;
use std::io::{self, BufReader, Read, Write};
use std::net::Shutdown;
use std::os::unix::fs::FileTypeExt;
use std::os::unix::net::UnixStream;
use std::path::Path;

use anyhow::{bail, Context, Result};

use crate::config::{ServerConfig, StalePolicy};
use crate::protocol::{self, STATUS_NORMAL, STOP_KEYWORD};

/// Stop whatever server holds `config.socket_path`, then remove the file.
///
/// Does nothing when the path is not a socket. Any failure to stop a server
/// that exists is an error; the caller must not bind in that case.
pub fn take_over(config: &ServerConfig) -> Result<()> {
    let path = config.socket_path.as_path();
    let is_socket = fs::symlink_metadata(path)
        .map(|meta| meta.file_type().is_socket())
        .unwrap_or(false);
    if !is_socket {
        return Ok(());
    }

    let debug = config.debug.enabled();
    if debug {
        print!("Shutting down existing prefork-server at {}...", path.display());
        let _ = io::stdout().flush();
    }

    match stop_existing(path, config.stale_policy) {
        Ok(()) => {
            if debug {
                println!("Success!");
            }
        }
        Err(e) => {
            if debug {
                println!("FAILED!!!");
            }
            return Err(e.context("Error shutting down server on existing socket"));
        }
    }

    remove_socket_file(path)
}

/// Remove the socket file, ignoring "already gone".
pub fn remove_socket_file(path: &Path) -> Result<()> {
    match fs::remove_file(path) {
        Ok(()) => {
            log::debug!("Removed socket file {}", path.display());
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("Failed to remove {}", path.display())),
    }
}

fn stop_existing(path: &Path, stale_policy: StalePolicy) -> Result<()> {
    let stream = match UnixStream::connect(path) {
        Ok(stream) => stream,
        Err(e)
            if stale_policy == StalePolicy::Remove
                && matches!(
                    e.kind(),
                    io::ErrorKind::ConnectionRefused | io::ErrorKind::NotFound
                ) =>
        {
            log::info!("Nothing listening on {} ({e}), treating it as stale", path.display());
            return Ok(());
        }
        Err(e) => return Err(e).context("Failed to connect"),
    };
    request_stop(&stream)
}

/// Client half of a stop request on an open connection.
pub fn request_stop(stream: &UnixStream) -> Result<()> {
    let mut reader = BufReader::new(stream);
    let pid = protocol::read_pid_line(&mut reader)?;
    log::debug!("Existing server worker has pid {pid}");

    protocol::send_stdio(stream)?;
    protocol::write_line(&mut &*stream, STOP_KEYWORD).context("Failed to send stop")?;
    stream
        .shutdown(Shutdown::Write)
        .context("Failed to half-close connection")?;

    let mut rest = Vec::new();
    reader
        .read_to_end(&mut rest)
        .context("Failed to read stop confirmation")?;
    match rest.last() {
        Some(&STATUS_NORMAL) => Ok(()),
        Some(other) => bail!("Existing server refused to stop (status {:?})", char::from(*other)),
        None => bail!("Existing server closed the connection without a status"),
    }
}
