//! Wire protocol shared by the server, its workers, and the client.
//!
//! Every field on the connection is a NUL-terminated line except the final
//! status byte and the passed descriptors. One request looks like this:
//!
//! ```text
//! worker ──► client   "<pid>\0"
//! client ──► worker   stdin, stdout, stderr   (SCM_RIGHTS, one "\0" byte each)
//! client ──► worker   "<cwd>\0" | "stop\0"
//! client ──► worker   "KEY=VALUE\0" ... "\0"
//! client ──► worker   "<arg>\0" ...            (ended by half-close)
//! worker ──► client   '0' | '1'                (then half-close + close)
//! ```
//!
//! The pid line doubles as the readiness signal: the takeover logic in a
//! successor server refuses any peer whose pid is not greater than 1.

// Rust guideline compliant 2026-02

use std::ffi::{OsStr, OsString};
use std::io::{self, BufRead, Write};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::net::UnixStream;

use anyhow::{bail, Context, Result};

/// Directory-line value that asks the server to shut down.
pub const STOP_KEYWORD: &str = "stop";

/// Status byte for a normal worker completion.
pub const STATUS_NORMAL: u8 = b'0';

/// Status byte for an abnormal worker completion.
pub const STATUS_ABNORMAL: u8 = b'1';

/// Line terminator.
const NUL: u8 = 0;

// ─── Line framing ──────────────────────────────────────────────────────────

/// Write `line` followed by a NUL terminator.
pub fn write_line<W: Write>(writer: &mut W, line: &str) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(&[NUL])
}

/// Write a line of raw OS bytes, for paths and environment entries.
pub fn write_os_line<W: Write>(writer: &mut W, line: &OsStr) -> io::Result<()> {
    writer.write_all(line.as_bytes())?;
    writer.write_all(&[NUL])
}

/// Read one NUL-terminated line as raw bytes, without the terminator.
///
/// Returns `Ok(None)` at end of stream when nothing was read. A trailing
/// fragment without a terminator is returned as a line of its own.
fn read_raw_line<R: BufRead>(reader: &mut R) -> io::Result<Option<Vec<u8>>> {
    let mut buf = Vec::new();
    let n = reader.read_until(NUL, &mut buf)?;
    if n == 0 {
        return Ok(None);
    }
    if buf.last() == Some(&NUL) {
        buf.pop();
    }
    Ok(Some(buf))
}

/// Read one NUL-terminated line as text. Invalid UTF-8 is replaced.
pub fn read_line<R: BufRead>(reader: &mut R) -> io::Result<Option<String>> {
    Ok(read_raw_line(reader)?.map(|buf| String::from_utf8_lossy(&buf).into_owned()))
}

/// Read one NUL-terminated line with its bytes untouched.
pub fn read_os_line<R: BufRead>(reader: &mut R) -> io::Result<Option<OsString>> {
    Ok(read_raw_line(reader)?.map(OsString::from_vec))
}

/// Read one line that must be present; EOF is an error.
pub fn expect_line<R: BufRead>(reader: &mut R, what: &str) -> Result<String> {
    read_line(reader)
        .with_context(|| format!("Failed to read {what}"))?
        .with_context(|| format!("Connection closed before {what}"))
}

/// [`expect_line`] for raw OS bytes.
pub fn expect_os_line<R: BufRead>(reader: &mut R, what: &str) -> Result<OsString> {
    read_os_line(reader)
        .with_context(|| format!("Failed to read {what}"))?
        .with_context(|| format!("Connection closed before {what}"))
}

// ─── Pid line ──────────────────────────────────────────────────────────────

/// Announce the worker's pid to the peer.
pub fn write_pid<W: Write>(writer: &mut W, pid: u32) -> io::Result<()> {
    write_line(writer, &pid.to_string())?;
    writer.flush()
}

/// Read the peer's pid line and check that it names a real worker process.
///
/// Anything that does not parse to a value above 1 is rejected, which is how
/// a non-prefork listener on the socket path is told apart from a worker.
pub fn read_pid_line<R: BufRead>(reader: &mut R) -> Result<u32> {
    let line = expect_line(reader, "worker pid")?;
    match line.trim().parse::<u32>() {
        Ok(pid) if pid > 1 => Ok(pid),
        _ => bail!("Invalid prefork worker pid"),
    }
}

// ─── Environment and arguments ─────────────────────────────────────────────

/// Send the environment as `KEY=VALUE` lines followed by an empty line.
///
/// Keys and values go out as raw bytes; nothing is re-encoded.
pub fn write_env<W, I, K, V>(writer: &mut W, vars: I) -> io::Result<()>
where
    W: Write,
    I: IntoIterator<Item = (K, V)>,
    K: AsRef<OsStr>,
    V: AsRef<OsStr>,
{
    for (key, value) in vars {
        let mut line = key.as_ref().to_os_string();
        line.push("=");
        line.push(value.as_ref());
        write_os_line(writer, &line)?;
    }
    write_line(writer, "")
}

/// Read `KEY=VALUE` lines until the empty terminator line.
///
/// A line is split at its first `=`; a line without one maps the whole line
/// to an empty value. Lines with an empty key are skipped. Later duplicates
/// replace earlier ones.
pub fn read_env<R: BufRead>(reader: &mut R) -> Result<Vec<(OsString, OsString)>> {
    let mut vars: Vec<(OsString, OsString)> = Vec::new();
    loop {
        let line = expect_os_line(reader, "environment terminator")?;
        if line.is_empty() {
            return Ok(vars);
        }
        let bytes = line.as_bytes();
        let (key, value) = match bytes.iter().position(|&b| b == b'=') {
            Some(at) => (&bytes[..at], &bytes[at + 1..]),
            None => (bytes, &[][..]),
        };
        if key.is_empty() {
            log::debug!("Skipping environment line without a key");
            continue;
        }
        let key = OsStr::from_bytes(key);
        let value = OsStr::from_bytes(value).to_os_string();
        match vars.iter_mut().find(|(k, _)| k.as_os_str() == key) {
            Some(slot) => slot.1 = value,
            None => vars.push((key.to_os_string(), value)),
        }
    }
}

/// Read argument lines until the peer half-closes its write side.
pub fn read_args<R: BufRead>(reader: &mut R) -> io::Result<Vec<String>> {
    let mut args = Vec::new();
    while let Some(arg) = read_line(reader)? {
        args.push(arg);
    }
    Ok(args)
}

// ─── Status byte ───────────────────────────────────────────────────────────

/// Map a completion flag to its status byte.
pub fn status_byte(normal: bool) -> u8 {
    if normal {
        STATUS_NORMAL
    } else {
        STATUS_ABNORMAL
    }
}

// ─── Descriptor passing (SCM_RIGHTS) ───────────────────────────────────────

/// Send one file descriptor over `stream`, carried by a single NUL byte.
pub fn send_fd(stream: &UnixStream, fd: RawFd) -> Result<()> {
    let payload = [NUL];
    let fd_size = std::mem::size_of::<libc::c_int>();
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space = unsafe { libc::CMSG_SPACE(fd_size as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space];

    let mut iov = libc::iovec {
        iov_base: payload.as_ptr() as *mut libc::c_void,
        iov_len: payload.len(),
    };

    // SAFETY: msghdr is a plain C struct; zeroed is a valid initial state.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_space as _;

    // SAFETY: the control buffer is CMSG_SPACE bytes for one fd, so the first
    // header exists and its data area holds one c_int.
    unsafe {
        let cmsg = libc::CMSG_FIRSTHDR(&msg);
        (*cmsg).cmsg_level = libc::SOL_SOCKET;
        (*cmsg).cmsg_type = libc::SCM_RIGHTS;
        (*cmsg).cmsg_len = libc::CMSG_LEN(fd_size as u32) as _;
        let data_ptr = libc::CMSG_DATA(cmsg).cast::<libc::c_int>();
        std::ptr::write_unaligned(data_ptr, fd);
    }

    loop {
        // SAFETY: msg points at live iov and control buffers for this call.
        let n = unsafe { libc::sendmsg(stream.as_raw_fd(), &msg, 0) };
        if n >= 0 {
            return Ok(());
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("sendmsg failed");
        }
    }
}

/// Receive one file descriptor sent by [`send_fd`].
///
/// Reads exactly one payload byte so no protocol bytes after the descriptor
/// are consumed.
pub fn recv_fd(stream: &UnixStream) -> Result<OwnedFd> {
    let mut payload = [0u8; 1];
    // SAFETY: CMSG_SPACE is a pure size computation.
    let cmsg_space =
        unsafe { libc::CMSG_SPACE(std::mem::size_of::<libc::c_int>() as u32) } as usize;
    let mut cmsg_buf = vec![0u8; cmsg_space * 4];

    let mut iov = libc::iovec {
        iov_base: payload.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: payload.len(),
    };
    // SAFETY: msghdr is a plain C struct; zeroed is a valid initial state.
    let mut msg: libc::msghdr = unsafe { std::mem::zeroed() };
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = cmsg_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = cmsg_buf.len() as _;

    let n = loop {
        // SAFETY: msg points at live iov and control buffers for this call.
        let n = unsafe { libc::recvmsg(stream.as_raw_fd(), &mut msg, libc::MSG_CMSG_CLOEXEC) };
        if n >= 0 {
            break n;
        }
        let err = io::Error::last_os_error();
        if err.kind() != io::ErrorKind::Interrupted {
            return Err(err).context("recvmsg failed");
        }
    };
    if n == 0 {
        bail!("Connection closed before file descriptor was passed");
    }

    let mut fds = Vec::new();
    // SAFETY: walking the control messages the kernel just filled in; every
    // SCM_RIGHTS fd is newly installed in this process and owned by us.
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            if (*cmsg).cmsg_level == libc::SOL_SOCKET && (*cmsg).cmsg_type == libc::SCM_RIGHTS {
                let data = libc::CMSG_DATA(cmsg);
                let fd_count = ((*cmsg).cmsg_len as usize - libc::CMSG_LEN(0) as usize)
                    / std::mem::size_of::<libc::c_int>();
                for i in 0..fd_count {
                    let fd: libc::c_int = std::ptr::read_unaligned(
                        data.add(i * std::mem::size_of::<libc::c_int>())
                            .cast::<libc::c_int>(),
                    );
                    fds.push(OwnedFd::from_raw_fd(fd));
                }
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    let mut fds = fds.into_iter();
    let fd = fds
        .next()
        .context("Expected a passed file descriptor, got a plain byte")?;
    // Extra descriptors are closed when the iterator drops.
    Ok(fd)
}

/// Send this process's stdin, stdout, and stderr, in that order.
pub fn send_stdio(stream: &UnixStream) -> Result<()> {
    for fd in [libc::STDIN_FILENO, libc::STDOUT_FILENO, libc::STDERR_FILENO] {
        send_fd(stream, fd).with_context(|| format!("Failed to pass fd {fd}"))?;
    }
    Ok(())
}

/// Receive the peer's stdin, stdout, and stderr, in that order.
pub fn recv_stdio(stream: &UnixStream) -> Result<[OwnedFd; 3]> {
    let stdin = recv_fd(stream).context("Failed to receive stdin")?;
    let stdout = recv_fd(stream).context("Failed to receive stdout")?;
    let stderr = recv_fd(stream).context("Failed to receive stderr")?;
    Ok([stdin, stdout, stderr])
}

// ─── Tests ─────────────────────────────────────────────────────────────────
