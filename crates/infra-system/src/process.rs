// Engine process control
// SIGTERM first, SIGKILL once the grace period runs out
use clipcast_core::port::TranscodeError;
use std::time::Duration;
use tracing::{info, warn};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Ask a process to stop (SIGTERM)
pub fn terminate(pid: i32) -> Result<(), TranscodeError> {
    if pid <= 0 {
        return Err(TranscodeError::Killed(format!("refusing to signal pid {}", pid)));
    }

    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGTERM)
            .map_err(|e| TranscodeError::Killed(format!("SIGTERM failed: {}", e)))
    }

    #[cfg(windows)]
    {
        force_kill(pid)
    }
}

fn force_kill(pid: i32) -> Result<(), TranscodeError> {
    #[cfg(unix)]
    {
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        kill(Pid::from_raw(pid), Signal::SIGKILL)
            .map_err(|e| TranscodeError::Killed(format!("SIGKILL failed: {}", e)))
    }

    #[cfg(windows)]
    {
        let output = std::process::Command::new("taskkill")
            .args(["/F", "/PID", &pid.to_string()])
            .output()
            .map_err(|e| TranscodeError::Killed(e.to_string()))?;

        if !output.status.success() {
            return Err(TranscodeError::Killed(format!(
                "taskkill failed: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(())
    }
}

/// Stop a process that is not our child: SIGTERM, poll, then SIGKILL after `grace`
pub async fn kill_graceful(pid: i32, grace: Duration) -> Result<(), TranscodeError> {
    if !is_alive(pid) {
        return Ok(());
    }

    info!(pid = pid, "Sending SIGTERM to engine process");
    terminate(pid)?;

    let deadline = tokio::time::Instant::now() + grace;
    while tokio::time::Instant::now() < deadline {
        tokio::time::sleep(POLL_INTERVAL).await;
        if !is_alive(pid) {
            info!(pid = pid, "Engine process exited after SIGTERM");
            return Ok(());
        }
    }

    warn!(pid = pid, "Engine process ignored SIGTERM, sending SIGKILL");
    force_kill(pid)
}

/// Whether a process with this pid exists
pub fn is_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }

    #[cfg(unix)]
    {
        use nix::errno::Errno;
        use nix::sys::signal::{kill, Signal};
        use nix::unistd::Pid;

        // Signal 0 only checks for existence; EPERM means it exists under another user
        match kill(Pid::from_raw(pid), None::<Signal>) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    #[cfg(windows)]
    {
        std::process::Command::new("tasklist")
            .args(["/FI", &format!("PID eq {}", pid), "/NH"])
            .output()
            .map(|output| String::from_utf8_lossy(&output.stdout).contains(&pid.to_string()))
            .unwrap_or(false)
    }
}
