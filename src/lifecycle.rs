//! PID-file interlock and daemonization (spec.md §4.5): a small lifecycle
//! object constructed once, handed to the rest of the process by
//! reference, so nothing else relies on module-level mutable state.

use std::path::{Path, PathBuf};

use log::{info, warn};

use crate::error::{BridgeError, Result};

/// What `check_already_running` found.
pub enum RunningCheck {
    /// No pidfile, or a pidfile whose process is gone / doesn't match:
    /// safe to proceed with startup.
    NotRunning,
    /// A live process matching this bridge already owns the pidfile:
    /// the caller should exit 0 silently (idempotent start).
    AlreadyRunning,
}

/// Reads `pidfile_path` if it exists and checks whether the recorded PID
/// is a live process whose command line identifies another instance of
/// this bridge. A recycled PID must not produce a false positive, so the
/// process name is compared too.
pub fn check_already_running(pidfile_path: &Path) -> RunningCheck {
    let contents = match std::fs::read_to_string(pidfile_path) {
        Ok(c) => c,
        Err(_) => return RunningCheck::NotRunning,
    };
    let pid: u32 = match contents.trim().parse() {
        Ok(p) => p,
        Err(_) => return RunningCheck::NotRunning,
    };

    let mut system = sysinfo::System::new();
    system.refresh_processes();
    let this_exe = std::env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()));

    match system.process(sysinfo::Pid::from_u32(pid)) {
        Some(process) => {
            let matches = this_exe
                .as_deref()
                .map(|exe| process.name().contains(exe) || exe.contains(process.name()))
                .unwrap_or(true);
            if matches {
                RunningCheck::AlreadyRunning
            } else {
                RunningCheck::NotRunning
            }
        }
        None => RunningCheck::NotRunning,
    }
}

/// Writes the current process id to `pidfile_path`, creating parent
/// directories as needed.
pub fn write_pidfile(pidfile_path: &Path) -> Result<()> {
    if let Some(parent) = pidfile_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(pidfile_path, format!("{}\n", std::process::id()))?;
    Ok(())
}

/// Removes the pidfile. Idempotent: a missing file is not an error.
pub fn remove_pidfile(pidfile_path: &Path) {
    let _ = std::fs::remove_file(pidfile_path);
}

/// Detaches from the controlling terminal via a double-fork + new
/// session, redirects stdin to null and stderr (with stdout mirrored to
/// it) to `logfile_path` or null, then writes the pidfile. Must run
/// before any tokio runtime is started: forking a multi-threaded process
/// is unsound.
///
/// `pidfile_path` missing while daemonizing is a fatal configuration
/// error per spec.md §4.5/§6.
#[cfg(unix)]
pub fn daemonize(pidfile_path: Option<&PathBuf>, logfile_path: Option<&PathBuf>) -> Result<()> {
    let pidfile_path = pidfile_path.ok_or_else(|| {
        BridgeError::Config("daemonize requires pidfile_path to be set".to_string())
    })?;

    let mut daemon = daemonize::Daemonize::new()
        .pid_file(pidfile_path)
        .umask(0o077);

    if let Some(log_path) = logfile_path {
        let stdout = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)?;
        let stderr = stdout.try_clone()?;
        daemon = daemon.stdout(stdout).stderr(stderr);
    }

    daemon
        .start()
        .map_err(|e| BridgeError::Config(format!("failed to daemonize: {e}")))?;
    Ok(())
}

#[cfg(windows)]
pub fn daemonize(pidfile_path: Option<&PathBuf>, _logfile_path: Option<&PathBuf>) -> Result<()> {
    // The outer bridge is already launched detached by the inner bridge's
    // spawn coordinator (CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS); it
    // has no controlling terminal to leave. Daemonizing here only means
    // honoring the pidfile requirement.
    if pidfile_path.is_none() {
        return Err(BridgeError::Config(
            "daemonize requires pidfile_path to be set".to_string(),
        ));
    }
    Ok(())
}

/// Registers `SIGHUP`/`SIGINT`/`SIGTERM` handlers on the inner bridge; on
/// receipt, runs `on_shutdown` (expected to be idempotent) and returns.
#[cfg(unix)]
pub async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    let mut hangup = signal(SignalKind::hangup()).expect("failed to install SIGHUP handler");
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("failed to install SIGINT handler");
    let mut terminate =
        signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");

    tokio::select! {
        _ = hangup.recv() => info!("received SIGHUP"),
        _ = interrupt.recv() => info!("received SIGINT"),
        _ = terminate.recv() => info!("received SIGTERM"),
    }
}

/// The outer bridge deliberately ignores Ctrl+C (the host analogue of
/// `SIGINT`) so it persists across console interrupts; this spawns a
/// task that drains and discards those events forever. Whether this
/// should extend to process termination is left open by the source
/// (spec.md §9, ambiguity (i)) — only Ctrl+C is suppressed here.
#[cfg(windows)]
pub fn ignore_console_interrupts() {
    tokio::spawn(async move {
        loop {
            match tokio::signal::windows::ctrl_c() {
                Ok(mut stream) => {
                    stream.recv().await;
                    warn!("ignoring Ctrl+C on outer bridge");
                }
                Err(e) => {
                    warn!("failed to install Ctrl+C handler: {e}");
                    break;
                }
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn missing_pidfile_means_not_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("does-not-exist.pid");
        assert!(matches!(
            check_already_running(&path),
            RunningCheck::NotRunning
        ));
    }

    #[test]
    fn stale_pid_in_file_means_not_running() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("stale.pid");
        // PID 1 is init/PID namespace root in virtually every environment
        // this test runs in, and will never be this binary's name.
        std::fs::write(&path, "1\n").unwrap();
        assert!(matches!(
            check_already_running(&path),
            RunningCheck::NotRunning
        ));
    }

    #[test]
    fn write_and_remove_pidfile_round_trip() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("bridge.pid");
        write_pidfile(&path).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.trim().parse::<u32>().unwrap(), std::process::id());
        remove_pidfile(&path);
        assert!(!path.exists());
        // Idempotent.
        remove_pidfile(&path);
    }
}
