// Terminates a spawned command together with everything it started.
// On Unix the engine puts each child in its own process group, so killing the
// group reaches grandchildren launched through the shell.

use std::io;

/// Signal delivered by [`ProcessTreeKiller::kill_tree`]. The engine only
/// ever stops a tree unconditionally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KillSignal {
    /// Terminate unconditionally (SIGKILL, `taskkill /F`).
    Kill,
}

pub trait ProcessTreeKiller: Send + Sync {
    fn kill_tree(&self, pid: u32, signal: KillSignal) -> io::Result<()>;
}

/// Platform implementation: `killpg` on Unix, `taskkill /T` on Windows.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemTreeKiller;

#[cfg(unix)]
impl ProcessTreeKiller for SystemTreeKiller {
    fn kill_tree(&self, pid: u32, signal: KillSignal) -> io::Result<()> {
        let signo = match signal {
            KillSignal::Kill => libc::SIGKILL,
        };
        let pid = libc::pid_t::try_from(pid)
            .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;

        // The child is the leader of its own group, so pgid == pid.
        let rc = unsafe { libc::killpg(pid, signo) };
        if rc == 0 {
            return Ok(());
        }
        let group_err = io::Error::last_os_error();
        // Fall back to the process itself if it never became a group leader.
        let rc = unsafe { libc::kill(pid, signo) };
        if rc == 0 {
            Ok(())
        } else {
            tracing::debug!(pid, error = %group_err, "killpg failed before kill fallback");
            Err(io::Error::last_os_error())
        }
    }
}

#[cfg(windows)]
impl ProcessTreeKiller for SystemTreeKiller {
    fn kill_tree(&self, pid: u32, signal: KillSignal) -> io::Result<()> {
        let mut command = std::process::Command::new("taskkill");
        command.arg("/PID").arg(pid.to_string()).arg("/T");
        match signal {
            KillSignal::Kill => command.arg("/F"),
        };
        let status = command
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::null())
            .status()?;
        if status.success() {
            Ok(())
        } else {
            Err(io::Error::other(format!("taskkill exited with {status}")))
        }
    }
}
