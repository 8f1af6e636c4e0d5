//! The container init sequence.
//!
//! This runs as the first process inside the new namespaces, started by
//! the runtime re-executing itself. It reads the user command from the
//! pipe on fd 3, switches its root to the current directory (the merged
//! workspace the parent placed it in), mounts `/proc` and `/dev`, and
//! replaces itself with the command.

use std::convert::Infallible;
use std::ffi::CString;
use std::fs::File;
use std::io::Read;
use std::os::fd::{FromRawFd, OwnedFd};
use std::path::Path;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;

use cellar_common::constants::{INIT_COMMAND_FD, INIT_COMMAND_TIMEOUT};
use cellar_common::error::{CellarError, Result};
use nix::mount::MsFlags;

use crate::filesystem::mount::mount_essential_filesystems;
use crate::filesystem::pivot_root::pivot_root;
use crate::syscall::Syscall;

/// Splits a command payload on spaces. Runs of spaces are collapsed.
///
/// # Errors
///
/// Returns [`CellarError::MissingCommand`] if no word remains.
pub fn parse_command(payload: &str) -> Result<Vec<String>> {
    let argv: Vec<String> = payload
        .trim_end_matches(['\n', '\0'])
        .split(' ')
        .filter(|word| !word.is_empty())
        .map(str::to_owned)
        .collect();
    if argv.is_empty() {
        return Err(CellarError::MissingCommand);
    }
    Ok(argv)
}

/// Reads the whole command payload from `fd` until the writer closes it.
///
/// # Errors
///
/// Returns [`CellarError::Timeout`] if the writer neither writes nor
/// closes within `timeout`, and [`CellarError::MissingCommand`] if the
/// payload is unreadable or empty.
pub fn read_command(fd: OwnedFd, timeout: Duration) -> Result<Vec<String>> {
    let (tx, rx) = mpsc::channel();
    let _reader = std::thread::Builder::new()
        .name("init-command".into())
        .spawn(move || {
            let mut payload = String::new();
            let result = File::from(fd).read_to_string(&mut payload).map(|_| payload);
            let _ = tx.send(result);
        })
        .map_err(|e| CellarError::io("init command pipe", e))?;

    match rx.recv_timeout(timeout) {
        Ok(Ok(payload)) => parse_command(&payload),
        Ok(Err(e)) => {
            tracing::error!(error = %e, "failed to read init command");
            Err(CellarError::MissingCommand)
        }
        Err(RecvTimeoutError::Timeout) => Err(CellarError::Timeout {
            operation: "init command",
            after: timeout,
        }),
        Err(RecvTimeoutError::Disconnected) => Err(CellarError::MissingCommand),
    }
}

/// Switches the root to the current directory and mounts `/proc` and
/// `/dev` in it.
///
/// Mount propagation is made private first so nothing done here leaks
/// back to the host's mount table.
///
/// # Errors
///
/// Returns the first mount or root-transition error.
pub fn setup_root(syscall: &dyn Syscall) -> Result<()> {
    let cwd = std::env::current_dir().map_err(|e| CellarError::RootTransition {
        step: "read working directory",
        source: e,
    })?;
    tracing::debug!(root = %cwd.display(), "container root");

    syscall
        .mount(
            None,
            Path::new("/"),
            None,
            MsFlags::MS_PRIVATE | MsFlags::MS_REC,
            None,
        )
        .map_err(|e| CellarError::RootTransition {
            step: "make mounts private",
            source: e.into(),
        })?;
    pivot_root(syscall, &cwd)?;
    mount_essential_filesystems(syscall)
}

/// Resolves `argv[0]` on `PATH` and replaces the process with it.
///
/// # Errors
///
/// Returns [`CellarError::NotFound`] if the executable cannot be found,
/// or [`CellarError::ExternalCommand`] if `execv(2)` fails. On success it
/// does not return.
pub fn exec_command(argv: &[String]) -> Result<Infallible> {
    let program = argv.first().ok_or(CellarError::MissingCommand)?;
    let path = which::which(program).map_err(|_| CellarError::NotFound {
        kind: "executable",
        id: program.clone(),
    })?;
    tracing::info!(path = %path.display(), "executing container command");

    let to_cstring = |s: &str| {
        CString::new(s).map_err(|_| CellarError::config(format!("argument {s:?} contains NUL")))
    };
    let c_path = to_cstring(&path.to_string_lossy())?;
    let c_argv = argv
        .iter()
        .map(|a| to_cstring(a))
        .collect::<Result<Vec<_>>>()?;

    nix::unistd::execv(&c_path, &c_argv).map_err(|e| CellarError::ExternalCommand {
        program: program.clone(),
        message: e.to_string(),
    })
}

/// Entry point of the container's init process.
///
/// # Errors
///
/// Returns an error if the command is missing, the root transition
/// fails, or the command cannot be executed. On success it does not
/// return.
#[allow(unsafe_code)]
pub fn run_container_init(syscall: &dyn Syscall) -> Result<Infallible> {
    // SAFETY: the parent dup2'd the read end of the command pipe onto
    // this descriptor before exec; nothing else in this process owns it.
    let fd = unsafe { OwnedFd::from_raw_fd(INIT_COMMAND_FD) };
    let argv = read_command(fd, INIT_COMMAND_TIMEOUT)?;
    tracing::info!(command = ?argv, "init received command");
    setup_root(syscall)?;
    exec_command(&argv)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn payload_splits_on_spaces() {
        assert_eq!(
            parse_command("/bin/sh -c  top").unwrap(),
            vec!["/bin/sh", "-c", "top"]
        );
    }

    #[test]
    fn blank_payload_is_missing_command() {
        assert!(matches!(parse_command(""), Err(CellarError::MissingCommand)));
        assert!(matches!(parse_command("   "), Err(CellarError::MissingCommand)));
    }

    #[test]
    fn command_is_read_until_writer_closes() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let mut writer = File::from(write);
        writer.write_all(b"sleep 5").unwrap();
        drop(writer);

        let argv = read_command(read, Duration::from_secs(5)).unwrap();
        assert_eq!(argv, vec!["sleep", "5"]);
    }

    #[test]
    fn silent_writer_times_out() {
        let (read, write) = nix::unistd::pipe().unwrap();
        let err = read_command(read, Duration::from_millis(50)).unwrap_err();
        assert!(matches!(err, CellarError::Timeout { operation: "init command", .. }));
        drop(write);
    }

    #[test]
    fn unknown_executable_is_not_found() {
        let err = exec_command(&["definitely-not-a-real-binary-4f2a".to_owned()]).unwrap_err();
        assert!(matches!(err, CellarError::NotFound { kind: "executable", .. }));
    }
}
