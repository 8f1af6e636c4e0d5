//! Spawning and reaping the container's init process.
//!
//! The init process is this same binary, re-executed with the hidden
//! `init` subcommand inside a `clone(2)` that creates the configured
//! namespaces. Its working directory is the container root, and file
//! descriptor 3 is the read end of the pipe that carries the user
//! command.

use std::ffi::{CStr, CString};
use std::fs::File;
use std::io::Write;
use std::os::fd::{AsRawFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::time::{Duration, Instant};

use cellar_common::constants::{APP_NAME, INIT_COMMAND_FD, INIT_SUBCOMMAND};
use cellar_common::error::{CellarError, Result};
use cellar_core::namespace::NamespaceConfig;
use libc::c_char;
use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::sys::signal::{Signal, kill};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::{Pid, pipe2};

use crate::container::is_alive;

/// Stack handed to the cloned child. It only runs until `execve`.
const STACK_SIZE: usize = 1024 * 1024;

const SELF_EXE: &str = "/proc/self/exe";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// What the init process is started with.
#[derive(Debug)]
pub struct SpawnConfig<'a> {
    /// Mounted container root; becomes the child's working directory.
    pub root: &'a Path,
    /// Destination of stdout and stderr; `None` inherits the terminal.
    pub log: Option<&'a File>,
    /// Extra `KEY=VALUE` entries appended to the inherited environment.
    pub env: &'a [String],
    /// Namespaces to create.
    pub namespaces: NamespaceConfig,
}

/// Starts init processes.
pub trait Launcher {
    /// Starts a process per `config` that waits for its command.
    ///
    /// # Errors
    ///
    /// Returns an error if the process cannot be created.
    fn spawn(&self, config: &SpawnConfig<'_>) -> Result<InitProcess>;
}

/// [`Launcher`] that clones this binary into new namespaces.
#[derive(Debug, Default, Clone, Copy)]
pub struct CloneLauncher;

impl Launcher for CloneLauncher {
    fn spawn(&self, config: &SpawnConfig<'_>) -> Result<InitProcess> {
        let exe = c_string(SELF_EXE.as_bytes())?;
        let root = c_string(config.root.as_os_str().as_bytes())?;
        let argv = [c_string(APP_NAME.as_bytes())?, c_string(INIT_SUBCOMMAND.as_bytes())?];
        let env = child_environment(config.env)?;
        let argv_ptrs = null_terminated(&argv);
        let env_ptrs = null_terminated(&env);

        let (read_end, write_end) =
            pipe2(OFlag::O_CLOEXEC).map_err(|e| CellarError::io("command pipe", e.into()))?;
        let read_fd = read_end.as_raw_fd();
        let log_fd = config.log.map(AsRawFd::as_raw_fd);

        let mut stack = vec![0_u8; STACK_SIZE];
        let child = Box::new(move || -> isize {
            // SAFETY: runs in the freshly cloned child, which only makes
            // async-signal-safe libc calls on memory prepared above.
            unsafe { exec_init(read_fd, log_fd, &root, &exe, &argv_ptrs, &env_ptrs) }
        });
        // SAFETY: the child does not share memory with the parent (no
        // CLONE_VM) and replaces itself with execve before returning.
        let pid = unsafe {
            nix::sched::clone(
                child,
                &mut stack,
                config.namespaces.clone_flags(),
                Some(libc::SIGCHLD),
            )
        }
        .map_err(|e| CellarError::io(SELF_EXE, e.into()))?;
        drop(read_end);

        tracing::info!(
            pid = pid.as_raw(),
            root = %config.root.display(),
            detached = config.log.is_some(),
            "init process cloned"
        );
        Ok(InitProcess::new(pid, File::from(write_end)))
    }
}

/// Child side of the clone: wire up descriptors, enter the root, and
/// re-exec as `init`. Only returns on failure.
unsafe fn exec_init(
    command_fd: RawFd,
    log_fd: Option<RawFd>,
    root: &CStr,
    exe: &CStr,
    argv: &[*const c_char],
    envp: &[*const c_char],
) -> isize {
    // SAFETY: plain descriptor and exec syscalls on valid, NUL-terminated
    // buffers that outlive this call.
    unsafe {
        if let Some(fd) = log_fd {
            if libc::dup2(fd, libc::STDOUT_FILENO) < 0 || libc::dup2(fd, libc::STDERR_FILENO) < 0 {
                return 1;
            }
        }
        if command_fd == INIT_COMMAND_FD {
            if libc::fcntl(command_fd, libc::F_SETFD, 0) < 0 {
                return 1;
            }
        } else if libc::dup2(command_fd, INIT_COMMAND_FD) < 0 {
            return 1;
        }
        if libc::chdir(root.as_ptr()) < 0 {
            return 1;
        }
        let _ = libc::execve(exe.as_ptr(), argv.as_ptr(), envp.as_ptr());
    }
    127
}

/// A started init process and the write end of its command pipe.
#[derive(Debug)]
pub struct InitProcess {
    pid: Pid,
    command_pipe: Option<File>,
}

impl InitProcess {
    /// Wraps a started process whose command channel is `command_pipe`.
    #[must_use]
    pub const fn new(pid: Pid, command_pipe: File) -> Self {
        Self {
            pid,
            command_pipe: Some(command_pipe),
        }
    }

    /// Host pid.
    #[must_use]
    pub const fn pid(&self) -> Pid {
        self.pid
    }

    /// Host pid as stored in records.
    #[must_use]
    pub fn raw_pid(&self) -> u32 {
        self.pid.as_raw().unsigned_abs()
    }

    /// Writes the space-joined command and closes the pipe.
    ///
    /// # Errors
    ///
    /// Returns an error if the command was already sent or the write
    /// fails.
    pub fn send_command(&mut self, argv: &[String]) -> Result<()> {
        let mut pipe = self
            .command_pipe
            .take()
            .ok_or_else(|| CellarError::config("init command already sent"))?;
        let payload = argv.join(" ");
        pipe.write_all(payload.as_bytes())
            .map_err(|e| CellarError::io("command pipe", e))?;
        tracing::debug!(pid = self.pid.as_raw(), command = %payload, "init command sent");
        Ok(())
    }

    /// Blocks until the process exits and returns its exit code.
    ///
    /// # Errors
    ///
    /// Returns an error if the process is not a child of this one.
    pub fn wait(&self) -> Result<i32> {
        wait_for(self.pid)
    }
}

/// Blocks until child `pid` exits. A death by signal maps to `128 + n`.
///
/// # Errors
///
/// Returns an error if `waitpid` fails for a reason other than `EINTR`.
pub fn wait_for(pid: Pid) -> Result<i32> {
    loop {
        match waitpid(pid, None) {
            Ok(WaitStatus::Exited(_, code)) => return Ok(code),
            Ok(WaitStatus::Signaled(_, signal, _)) => return Ok(128 + signal as i32),
            Ok(_) | Err(Errno::EINTR) => {}
            Err(e) => return Err(CellarError::io(format!("/proc/{pid}"), e.into())),
        }
    }
}

/// Kills child `pid` with `SIGKILL` and reaps it.
///
/// # Errors
///
/// Returns an error if the signal cannot be delivered or the child
/// cannot be reaped.
pub fn kill_and_reap(pid: Pid) -> Result<()> {
    match kill(pid, Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => {}
        Err(e) => return Err(CellarError::io(format!("/proc/{pid}"), e.into())),
    }
    let _ = wait_for(pid)?;
    tracing::debug!(pid = pid.as_raw(), "init process killed");
    Ok(())
}

/// Sends `SIGTERM`, waits up to `grace` for `pid` to go away, then sends
/// `SIGKILL`. Works for processes started by other invocations.
///
/// # Errors
///
/// Returns an error if a signal cannot be delivered.
pub fn terminate(pid: Pid, grace: Duration) -> Result<()> {
    match kill(pid, Signal::SIGTERM) {
        Ok(()) => tracing::info!(pid = pid.as_raw(), "sent SIGTERM"),
        Err(Errno::ESRCH) => return Ok(()),
        Err(e) => return Err(CellarError::io(format!("/proc/{pid}"), e.into())),
    }
    if exited_within(pid, grace) {
        return Ok(());
    }
    match kill(pid, Signal::SIGKILL) {
        Ok(()) => tracing::info!(pid = pid.as_raw(), "sent SIGKILL"),
        Err(Errno::ESRCH) => {}
        Err(e) => return Err(CellarError::io(format!("/proc/{pid}"), e.into())),
    }
    let _ = exited_within(pid, POLL_INTERVAL);
    Ok(())
}

fn exited_within(pid: Pid, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        // Reaps it when it is our own child; ECHILD otherwise.
        let _ = waitpid(pid, Some(WaitPidFlag::WNOHANG));
        if !is_alive(pid.as_raw().unsigned_abs()) {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(POLL_INTERVAL);
    }
}

fn c_string(bytes: &[u8]) -> Result<CString> {
    CString::new(bytes).map_err(|_| {
        CellarError::config(format!(
            "{:?} contains a NUL byte",
            String::from_utf8_lossy(bytes)
        ))
    })
}

fn child_environment(extra: &[String]) -> Result<Vec<CString>> {
    let mut env = Vec::new();
    for (key, value) in std::env::vars_os() {
        let mut entry = key.as_bytes().to_vec();
        entry.push(b'=');
        entry.extend_from_slice(value.as_bytes());
        env.push(c_string(&entry)?);
    }
    for entry in extra {
        if !entry.contains('=') {
            return Err(CellarError::config(format!(
                "environment entry {entry:?} must be KEY=VALUE"
            )));
        }
        env.push(c_string(entry.as_bytes())?);
    }
    Ok(env)
}

fn null_terminated(strings: &[CString]) -> Vec<*const c_char> {
    strings
        .iter()
        .map(|s| s.as_ptr())
        .chain(std::iter::once(std::ptr::null()))
        .collect()
}
