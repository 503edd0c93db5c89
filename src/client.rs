//! Client side of a request.
//!
//! Connects to the server, hands over this process's stdin, stdout, and
//! stderr, sends the working directory, environment, and arguments, then
//! waits for the worker's status byte. Everything the command prints goes
//! straight to our streams; the client itself only reads the status.

use std::io::{BufReader, Read};
use std::net::Shutdown;
use std::os::unix::net::UnixStream;

use anyhow::{Context, Result};

use crate::config::ClientConfig;
use crate::protocol::{self, STATUS_NORMAL};

/// Sends one request to a running server.
#[derive(Debug, Clone)]
pub struct Client {
    config: ClientConfig,
}

impl Client {
    /// Client for the configured socket.
    pub fn new(config: ClientConfig) -> Self {
        Self { config }
    }

    /// Run `args` in a worker and return the exit code for this process:
    /// 0 when the worker reported a normal exit, 1 otherwise.
    ///
    /// # Errors
    ///
    /// Fails when the server cannot be reached or the handshake breaks off
    /// before the request was sent.
    pub fn run(&self, args: &[String]) -> Result<i32> {
        let path = &self.config.socket_path;
        let stream = UnixStream::connect(path).with_context(|| {
            format!("Error connecting to prefork-server at {}", path.display())
        })?;

        let mut reader = BufReader::new(&stream);
        let pid = protocol::read_pid_line(&mut reader)?;
        log::debug!("Connected to worker {pid}");

        protocol::send_stdio(&stream)?;
        self.send_request(&stream, args)
            .context("Failed to send request")?;

        let mut rest = Vec::new();
        reader
            .read_to_end(&mut rest)
            .context("Failed to read worker status")?;
        let code = match rest.last() {
            Some(&STATUS_NORMAL) => 0,
            _ => 1,
        };
        log::debug!("Worker {pid} finished with exit code {code}");
        Ok(code)
    }

    fn send_request(&self, stream: &UnixStream, args: &[String]) -> Result<()> {
        let cwd = std::env::current_dir().context("Failed to read working directory")?;
        let mut writer = stream;
        protocol::write_os_line(&mut writer, cwd.as_os_str())?;
        protocol::write_env(&mut writer, std::env::vars_os())?;
        for arg in args {
            protocol::write_line(&mut writer, arg)?;
        }
        stream.shutdown(Shutdown::Write)?;
        Ok(())
    }
}
