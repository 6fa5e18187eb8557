//! Pairing and spawn coordinator: the inner bridge resolves its own
//! script path in host-visible form and launches the outer bridge as a
//! detached child (spec.md §4.4, §9 "Cross-environment spawning").
//!
//! The platform specifics are behind [`HostLauncher`] so the spawn logic
//! is swappable and testable with a fake.

use std::process::Child;

use log::info;

use crate::error::{BridgeError, Result};

/// A handle to the spawned outer-bridge child. Tracked only so it can
/// optionally be signaled on shutdown; disabled by default because the
/// outer is meant to outlive inner restarts (spec.md §4.4).
pub struct ChildHandle {
    child: Option<Child>,
}

impl ChildHandle {
    pub fn detached() -> ChildHandle {
        ChildHandle { child: None }
    }

    pub fn tracked(child: Child) -> ChildHandle {
        ChildHandle { child: Some(child) }
    }

    pub fn kill(&mut self) {
        if let Some(child) = self.child.as_mut() {
            let _ = child.kill();
        }
    }
}

/// One operation: launch a host-visible path with arguments, detached
/// from the caller's lifecycle.
pub trait HostLauncher {
    fn launch(&self, host_path: &str, args: &[String]) -> Result<ChildHandle>;
}

/// Translates the running binary's own path to a host-visible path via
/// `wslpath -w`, then spawns the Windows binary doubly detached
/// (`CREATE_NEW_PROCESS_GROUP | DETACHED_PROCESS`), mirroring the
/// teacher's `creation_flags(0x0000_0200 | 0x0000_0008 | 0x0400_0000)`.
pub struct WslHostLauncher;

impl WslHostLauncher {
    /// Translates a subsystem-visible path to the host-visible path the
    /// Windows interpreter needs, using the standard WSL path-translation
    /// utility.
    pub fn translate_path(subsystem_path: &str) -> Result<String> {
        let output = std::process::Command::new("wslpath")
            .arg("-w")
            .arg(subsystem_path)
            .output()
            .map_err(|e| BridgeError::Spawn(format!("wslpath not found: {e}")))?;
        if !output.status.success() {
            return Err(BridgeError::Spawn(format!(
                "wslpath failed to translate {subsystem_path}: {}",
                String::from_utf8_lossy(&output.stderr)
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_owned())
    }
}

#[cfg(unix)]
impl HostLauncher for WslHostLauncher {
    fn launch(&self, host_path: &str, args: &[String]) -> Result<ChildHandle> {
        use std::os::unix::process::CommandExt;

        info!("spawning outer bridge: {host_path} {args:?}");
        let mut cmd = std::process::Command::new(host_path);
        cmd.args(args);
        // Detach into a new session so the outer bridge survives even if
        // the inner bridge is killed.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }
        cmd.spawn()
            .map(ChildHandle::tracked)
            .map_err(|e| BridgeError::Spawn(format!("failed to exec {host_path}: {e}")))
    }
}

/// Spawns the outer bridge for the given binary path and config-derived
/// arguments, translating the running binary's own path to a
/// host-visible one first.
pub async fn spawn_outer_bridge(
    launcher: &dyn HostLauncher,
    own_subsystem_path: &str,
    outer_args: Vec<String>,
) -> Result<ChildHandle> {
    let host_path = WslHostLauncher::translate_path(own_subsystem_path)?;
    launcher.launch(&host_path, &outer_args)
}

/// Translates the inner bridge's local noncefile path to the host-visible
/// path the outer bridge should use, via the same `wslpath -w` utility
/// used to locate the outer binary itself. WSL exposes any subsystem path
/// this way (not just `/mnt/<drive>` paths) as a `\\wsl$\...` network
/// path, so this works regardless of where `noncefile_path` resolved to.
pub fn translate_noncefile_path(subsystem_noncefile_path: &std::path::Path) -> Result<String> {
    WslHostLauncher::translate_path(&subsystem_noncefile_path.to_string_lossy())
}

/// Builds the outer bridge's argument list from the inner's config,
/// forwarding the fields the outer needs on its own command line
/// (spec.md §4.4, §6 configuration surface table).
///
/// `host_noncefile_path` is the inner's own noncefile path translated to
/// host-visible form (see [`translate_noncefile_path`]). Forwarding it
/// explicitly is what lets both sides agree on the file's content
/// (spec.md §4.4's invariant): left to independent defaults, the inner's
/// subsystem home directory and the outer's Windows home directory are
/// different filesystems, so the outer would generate a nonce the inner
/// could never read.
pub fn build_outer_args(config: &crate::config::Config, host_noncefile_path: &str) -> Vec<String> {
    let mut args = vec![
        "--mode".to_string(),
        "outer".to_string(),
        "--windows-address".to_string(),
        config.windows_address.clone(),
        "--base-port".to_string(),
        config.base_port.to_string(),
        "--noncefile-path".to_string(),
        host_noncefile_path.to_string(),
    ];
    if config.enable_ssh {
        args.push("--enable-ssh".to_string());
    }
    if let Some(p) = &config.windows_logfile_path {
        args.push("--logfile-path".to_string());
        args.push(p.clone());
    }
    if let Some(p) = &config.windows_pidfile_path {
        args.push("--pidfile-path".to_string());
        args.push(p.clone());
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use crate::config::{LogLevel, Mode};

    struct FakeLauncher {
        calls: Mutex<Vec<(String, Vec<String>)>>,
    }

    impl HostLauncher for FakeLauncher {
        fn launch(&self, host_path: &str, args: &[String]) -> Result<ChildHandle> {
            self.calls
                .lock()
                .unwrap()
                .push((host_path.to_string(), args.to_vec()));
            Ok(ChildHandle::detached())
        }
    }

    fn sample_config() -> crate::config::Config {
        crate::config::Config {
            mode: Mode::Inner,
            remote_address: "127.0.0.1".into(),
            windows_address: "0.0.0.0".into(),
            base_port: 6910,
            enable_ssh: true,
            noncefile_path: None,
            logfile_path: None,
            pidfile_path: None,
            daemonize: false,
            log_level: LogLevel::Info,
            windows_logfile_path: Some("C:\\logs\\outer.log".into()),
            windows_pidfile_path: Some("C:\\logs\\outer.pid".into()),
        }
    }

    #[test]
    fn outer_args_forward_config_fields() {
        let args = build_outer_args(&sample_config(), "C:\\Users\\me\\.gnupg\\wsl-gpg-bridge.nonce");
        assert!(args.contains(&"--enable-ssh".to_string()));
        assert!(args.contains(&"6910".to_string()));
        assert!(args.contains(&"C:\\logs\\outer.log".to_string()));
        assert!(args.contains(&"--noncefile-path".to_string()));
        assert!(args.contains(&"C:\\Users\\me\\.gnupg\\wsl-gpg-bridge.nonce".to_string()));
    }

    #[tokio::test]
    async fn fake_launcher_records_the_call() {
        let launcher = FakeLauncher {
            calls: Mutex::new(Vec::new()),
        };
        let _handle = launcher.launch("C:\\outer.exe", &["--mode".into(), "outer".into()]);
        let calls = launcher.calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].0, "C:\\outer.exe");
    }
}
