//! Child-side setup between fork and execve.
//!
//! Everything here runs in the forked child before the user command
//! replaces it. Failures are fatal: they are written to stderr (which still
//! points at the supervisor's log at that point) and end in abort, which
//! the parent observes as a SIGABRT death.

use std::collections::HashMap;
use std::ffi::CString;
use std::fs::File;
use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::fs::OpenOptionsExt;

use nix::sys::signal::{signal, SigHandler, Signal};
use nix::unistd::{chdir, dup2, execve, setgroups, setpgid, setresgid, setresuid, Gid, Pid, Uid};
use prost::Message;

use crate::proto::{CanStartMessage, ChildProcessReady};
use crate::util::close_fd_from;

/// How the child's stdio is wired before exec.
pub enum ChildStdio {
    /// Batch: stdout/stderr go to files; stdin is closed.
    Batch {
        stdout_path: String,
        /// Empty means stderr is merged into stdout.
        stderr_path: String,
    },
    /// Interactive without a pty: one socket becomes fd 0, 1 and 2.
    Socket(OwnedFd),
    /// Interactive with a pty: the slave side is already on 0, 1, 2.
    Pty,
}

pub struct ChildSetup {
    pub uid: u32,
    pub gid: u32,
    /// Primary gid from the password entry; added to the supplementary set
    /// together with the task gid.
    pub pwent_gid: u32,
    pub cwd: String,
    pub stdio: ChildStdio,
    pub env: HashMap<String, String>,
    pub script_path: String,
    pub args: Vec<String>,
    /// Run bash --login to reconstruct the user's login environment.
    pub login_shell: bool,
}

macro_rules! child_fatal {
    ($($arg:tt)*) => {{
        eprintln!("[Supervisor Subprocess] Error: {}", format!($($arg)*));
        std::process::abort();
    }};
}

/// Finish the child side: privilege drop, handshake, fd plumbing, execve.
/// Never returns.
pub fn run_child(ctrl_fd: OwnedFd, setup: ChildSetup) -> ! {
    // Default disposition for SIGABRT so a failing child dies plainly.
    unsafe {
        let _ = signal(Signal::SIGABRT, SigHandler::SigDfl);
    }

    let mut gids = Vec::with_capacity(2);
    if setup.gid != setup.pwent_gid {
        gids.push(Gid::from_raw(setup.gid));
    }
    gids.push(Gid::from_raw(setup.pwent_gid));
    if let Err(e) = setgroups(&gids) {
        child_fatal!("setgroups() failed: {e}");
    }

    let gid = Gid::from_raw(setup.gid);
    if let Err(e) = setresgid(gid, gid, gid) {
        child_fatal!("setresgid() failed: {e}");
    }

    let uid = Uid::from_raw(setup.uid);
    if let Err(e) = setresuid(uid, uid, uid) {
        child_fatal!("setresuid() failed: {e}");
    }

    if let Err(e) = chdir(setup.cwd.as_str()) {
        child_fatal!("chdir to {} failed: {e}", setup.cwd);
    }

    // The child becomes its own process group leader so the whole task
    // tree can be signalled at once.
    if let Err(e) = setpgid(Pid::from_raw(0), Pid::from_raw(0)) {
        child_fatal!("setpgid() failed: {e}");
    }

    // Wait for the parent's go-ahead: it has migrated us into the job
    // cgroup by now, or asks us to quit.
    let mut ctrl = File::from(ctrl_fd);
    let can_start: CanStartMessage = match read_delimited(&mut ctrl) {
        Ok(msg) => msg,
        Err(e) => child_fatal!("failed to read control socket from parent: {e}"),
    };
    if !can_start.ok {
        child_fatal!("parent process asked to quit");
    }

    let is_batch = matches!(setup.stdio, ChildStdio::Batch { .. });
    match &setup.stdio {
        ChildStdio::Batch {
            stdout_path,
            stderr_path,
        } => {
            let stdout_file = match open_output_file(stdout_path) {
                Ok(file) => file,
                Err(e) => child_fatal!("open {stdout_path} failed: {e}"),
            };
            if let Err(e) = dup2(stdout_file.as_raw_fd(), 1) {
                child_fatal!("dup2 stdout failed: {e}");
            }
            if stderr_path.is_empty() {
                if let Err(e) = dup2(stdout_file.as_raw_fd(), 2) {
                    child_fatal!("dup2 stderr failed: {e}");
                }
            } else {
                let stderr_file = match open_output_file(stderr_path) {
                    Ok(file) => file,
                    Err(e) => child_fatal!("open {stderr_path} failed: {e}"),
                };
                if let Err(e) = dup2(stderr_file.as_raw_fd(), 2) {
                    child_fatal!("dup2 stderr failed: {e}");
                }
            }
        }
        ChildStdio::Socket(sock) => {
            for fd in 0..=2 {
                if let Err(e) = dup2(sock.as_raw_fd(), fd) {
                    child_fatal!("dup2 io socket onto {fd} failed: {e}");
                }
            }
        }
        ChildStdio::Pty => {}
    }

    let ready = ChildProcessReady { ok: true };
    if let Err(e) = write_delimited(&mut ctrl, &ready) {
        child_fatal!("failed to notify parent: {e}");
    }
    drop(ctrl);

    // A batch task keeps no stdin; a lingering fd would make programs like
    // mpirun wait on input forever.
    if is_batch {
        unsafe {
            libc::close(0);
        }
    }
    close_fd_from(3);

    let envp: Vec<CString> = setup
        .env
        .iter()
        .filter_map(|(k, v)| CString::new(format!("{k}={v}")).ok())
        .collect();

    // Argv[0] is the program name and can be anything.
    let mut argv = vec![CString::new("CraneScript").unwrap()];
    if setup.login_shell {
        argv.push(CString::new("--login").unwrap());
    }
    let script = match CString::new(setup.script_path.as_str()) {
        Ok(script) => script,
        Err(e) => child_fatal!("script path is not a valid C string: {e}"),
    };
    argv.push(script);
    for arg in &setup.args {
        if let Ok(arg) = CString::new(arg.as_str()) {
            argv.push(arg);
        }
    }

    let shell = CString::new("/bin/bash").unwrap();
    let err = execve(&shell, &argv, &envp).unwrap_err();
    child_fatal!("execve() failed: {err}");
}

fn open_output_file(path: &str) -> std::io::Result<File> {
    std::fs::OpenOptions::new()
        .read(true)
        .write(true)
        .create(true)
        .truncate(true)
        .mode(0o644)
        .open(path)
}

/// Write one length-delimited protobuf message to a blocking fd.
pub fn write_delimited<M: Message>(writer: &mut impl Write, msg: &M) -> std::io::Result<()> {
    let mut buf = Vec::with_capacity(msg.encoded_len() + 5);
    msg.encode_length_delimited(&mut buf)
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
    writer.write_all(&buf)?;
    writer.flush()
}

/// Read one length-delimited protobuf message from a blocking fd.
pub fn read_delimited<M: Message + Default>(reader: &mut impl Read) -> std::io::Result<M> {
    // Varint length prefix, one byte at a time.
    let mut len: usize = 0;
    let mut shift = 0;
    loop {
        let mut byte = [0u8; 1];
        reader.read_exact(&mut byte)?;
        len |= ((byte[0] & 0x7f) as usize) << shift;
        if byte[0] & 0x80 == 0 {
            break;
        }
        shift += 7;
        if shift > 28 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidData,
                "message length varint too long",
            ));
        }
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body)?;
    M::decode(body.as_slice())
        .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delimited_round_trip() {
        let mut buf = Vec::new();
        write_delimited(&mut buf, &CanStartMessage { ok: true }).unwrap();
        write_delimited(&mut buf, &ChildProcessReady { ok: false }).unwrap();

        let mut cursor = std::io::Cursor::new(buf);
        let first: CanStartMessage = read_delimited(&mut cursor).unwrap();
        let second: ChildProcessReady = read_delimited(&mut cursor).unwrap();
        assert!(first.ok);
        assert!(!second.ok);
    }

    #[test]
    fn read_rejects_oversized_varint() {
        let mut cursor = std::io::Cursor::new(vec![0xffu8; 8]);
        let result: std::io::Result<CanStartMessage> = read_delimited(&mut cursor);
        assert!(result.is_err());
    }
}
