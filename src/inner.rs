//! The inner bridge (spec.md §4.1): exposes the client-facing filesystem
//! sockets and multiplexes each client onto an authenticated TCP
//! connection to the outer bridge.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::net::{TcpStream, UnixListener, UnixStream};

use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::lifecycle;
use crate::nonce;
use crate::socket_class::SocketClass;
use crate::spawn::{self, HostLauncher, WslHostLauncher};
use crate::splice;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolves the subsystem-side canonical socket path for `class` by
/// asking gpgconf, matching the teacher's `load_gpg_socket_path`.
async fn gpgconf_socket_path(class: SocketClass) -> Result<PathBuf> {
    let output = tokio::process::Command::new("gpgconf")
        .arg("--list-dir")
        .arg(class.gpgconf_name())
        .output()
        .await
        .map_err(|e| BridgeError::Config(format!("failed to run gpgconf: {e}")))?;
    if !output.status.success() {
        return Err(BridgeError::Config(format!(
            "gpgconf --list-dir {} failed: {}",
            class.gpgconf_name(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let path = String::from_utf8(output.stdout)
        .map_err(|e| BridgeError::Config(format!("gpgconf output not UTF-8: {e}")))?;
    Ok(PathBuf::from(path.trim()))
}

/// Best-effort: send a terminate signal to any process matching the
/// agent's name. Failure is non-fatal. Spec.md §9 flags this as possibly
/// a historical workaround rather than a deliberate behavior; it is
/// preserved unchanged.
async fn stop_stray_local_agent() {
    let _ = tokio::process::Command::new("pkill")
        .arg("-f")
        .arg("gpg-agent")
        .output()
        .await;
}

/// Replaces a pre-existing socket file at `path`; a non-socket file
/// there is a fatal `ConfigError`.
fn unlink_stale_socket(path: &Path) -> Result<()> {
    if !path.exists() {
        return Ok(());
    }
    let metadata = std::fs::symlink_metadata(path)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::FileTypeExt;
        if !metadata.file_type().is_socket() {
            return Err(BridgeError::Config(format!(
                "{} exists and is not a socket",
                path.display()
            )));
        }
    }
    std::fs::remove_file(path)?;
    Ok(())
}

/// Starts the inner bridge: spawns the outer bridge, best-effort stops a
/// stray local agent, then opens one listener per enabled socket class
/// and serves it forever.
pub async fn start(config: Config) -> Result<()> {
    let launcher = WslHostLauncher;
    let own_path = std::env::current_exe()
        .map_err(|e| BridgeError::Spawn(format!("cannot resolve own path: {e}")))?;
    let noncefile_path = config.resolved_noncefile_path();
    // The outer bridge must generate its nonce at the same file the inner
    // reads; left to independent defaults the two sides' home directories
    // are different filesystems (spec.md §4.4), so the inner's resolved
    // path is translated and forwarded explicitly rather than re-derived.
    let host_noncefile_path = spawn::translate_noncefile_path(&noncefile_path)?;
    let outer_args = spawn::build_outer_args(&config, &host_noncefile_path);
    // Per spec.md §7, a spawn failure at startup is fatal, not recovered
    // locally: an unreachable interpreter or failed path translation maps
    // to exit code 2 via `BridgeError::Spawn` (spec.md §6).
    let _handle = spawn::spawn_outer_bridge(&launcher, &own_path.to_string_lossy(), outer_args).await?;
    info!("outer bridge spawned");

    stop_stray_local_agent().await;

    let classes = SocketClass::enabled(config.enable_ssh);
    let mut listeners = Vec::new();
    for class in classes {
        let path = gpgconf_socket_path(class).await?;
        unlink_stale_socket(&path)?;
        let listener = UnixListener::bind(&path)
            .map_err(|e| BridgeError::Config(format!("cannot bind {}: {e}", path.display())))?;
        info!("listening for {class} clients on {}", path.display());
        listeners.push((class, listener));
    }

    let remote_address = config.remote_address.clone();
    let base_port = config.base_port;
    let accept_loops = listeners.into_iter().map(|(class, listener)| {
        let remote_address = remote_address.clone();
        let noncefile_path = noncefile_path.clone();
        async move { accept_loop(class, listener, remote_address, base_port, noncefile_path).await }
    });

    tokio::select! {
        _ = futures::future::join_all(accept_loops) => {}
        _ = lifecycle::wait_for_shutdown_signal() => {
            info!("exiting");
        }
    }
    Ok(())
}

async fn accept_loop(
    class: SocketClass,
    listener: UnixListener,
    remote_address: String,
    base_port: u16,
    noncefile_path: PathBuf,
) {
    loop {
        let (client, _) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("{class} accept failed: {e}");
                break;
            }
        };
        let remote_address = remote_address.clone();
        let noncefile_path = noncefile_path.clone();
        tokio::spawn(async move {
            if let Err(e) =
                handle_client(class, client, &remote_address, base_port, &noncefile_path).await
            {
                error!("{class} worker failed: {e}");
            }
        });
    }
}

/// One accepted client: read the pairing nonce, connect to the outer
/// bridge, send the nonce, then splice (spec.md §4.1).
async fn handle_client(
    class: SocketClass,
    mut client: UnixStream,
    remote_address: &str,
    base_port: u16,
    noncefile_path: &Path,
) -> Result<()> {
    let pairing_nonce = nonce::read(noncefile_path).await?;

    let port = class.port(base_port);
    let mut outer = tokio::time::timeout(
        CONNECT_TIMEOUT,
        TcpStream::connect((remote_address, port)),
    )
    .await
    .map_err(|_| BridgeError::Io(std::io::Error::new(std::io::ErrorKind::TimedOut, "connect timed out")))?
    .map_err(BridgeError::Io)?;

    use tokio::io::AsyncWriteExt;
    outer.write_all(&pairing_nonce).await?;
    outer.flush().await?;

    debug!("{class} client paired with outer bridge on port {port}");
    splice::splice(&mut client, &mut outer).await?;
    Ok(())
}
