//! The outer bridge (spec.md §4.2): accepts authenticated TCP
//! connections from the inner bridge and forwards them to the native
//! Windows agent, one forwarder per socket class.

use std::path::PathBuf;
use std::sync::Arc;

use log::{debug, error, info, warn};
use tokio::io::AsyncReadExt;
use tokio::net::{TcpListener, TcpStream};

use crate::assuan;
use crate::config::Config;
use crate::error::{BridgeError, Result};
use crate::lifecycle;
use crate::nonce::{self, Nonce, NONCE_LEN};
use crate::socket_class::{ForwardMode, SocketClass};
use crate::splice;

/// Best-effort agent probe; failure is non-fatal and logged (spec.md §4.2).
async fn ping_agent() {
    let result = tokio::process::Command::new("gpg-connect-agent")
        .arg("/bye")
        .output()
        .await;
    match result {
        Ok(output) if !output.status.success() => {
            warn!(
                "agent probe returned failure: {}",
                String::from_utf8_lossy(&output.stderr)
            );
        }
        Err(e) => warn!("agent probe failed to run gpg-connect-agent: {e}"),
        Ok(_) => {}
    }
}

/// Starts the outer bridge: probes the agent, generates and persists the
/// pairing nonce, then opens one TCP listener per enabled socket class.
pub async fn start(config: Config) -> Result<()> {
    ping_agent().await;

    let noncefile_path = config.resolved_noncefile_path();
    let pairing_nonce = Arc::new(nonce::generate_and_persist(&noncefile_path).await?);

    #[cfg(windows)]
    lifecycle::ignore_console_interrupts();

    let classes = SocketClass::enabled(config.enable_ssh);
    let windows_address = config.windows_address.clone();
    let base_port = config.base_port;

    #[cfg(windows)]
    let ssh_adapter = Arc::new(crate::ssh_adapter::SshAdapter::new());

    let mut accept_loops = Vec::new();
    for class in classes {
        let bind_addr = format!("{}:{}", windows_address, class.port(base_port));
        let listener = TcpListener::bind(&bind_addr)
            .await
            .map_err(|e| BridgeError::Config(format!("cannot bind {bind_addr}: {e}")))?;
        info!("listening for {class} connections on {bind_addr}");
        let pairing_nonce = pairing_nonce.clone();
        #[cfg(windows)]
        let ssh_adapter = ssh_adapter.clone();
        accept_loops.push(async move {
            match class.forward_mode() {
                ForwardMode::Assuan => {
                    accept_assuan_loop(class, listener, pairing_nonce).await;
                }
                #[cfg(windows)]
                ForwardMode::WindowsMessageCopy => {
                    accept_ssh_loop(listener, pairing_nonce, ssh_adapter).await;
                }
                #[cfg(not(windows))]
                ForwardMode::WindowsMessageCopy => {
                    error!("AgentSsh class requires a Windows build; ignoring");
                }
            }
        });
    }

    tokio::select! {
        _ = futures::future::join_all(accept_loops) => {}
        _ = wait_for_shutdown() => {
            info!("exiting");
        }
    }

    nonce::remove(&noncefile_path).await;
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() {
    lifecycle::wait_for_shutdown_signal().await
}

#[cfg(windows)]
async fn wait_for_shutdown() {
    // The outer bridge ignores Ctrl+C (lifecycle::ignore_console_interrupts)
    // and has no other registered shutdown signal; it runs until the
    // process is terminated externally. Pending indefinitely here keeps
    // this future in the same `select!` shape as the Unix inner bridge.
    std::future::pending::<()>().await
}

/// Reads exactly 16 bytes and checks them against the in-memory pairing
/// nonce. Per spec.md §4.2/§8: on mismatch, close without forwarding any
/// payload and log at error level; no retry.
pub async fn authenticate(stream: &mut TcpStream, expected: &Nonce) -> Result<()> {
    let mut prefix = [0u8; NONCE_LEN];
    stream.read_exact(&mut prefix).await.map_err(|e| {
        BridgeError::Auth(format!("failed to read pairing nonce prefix: {e}"))
    })?;
    if &prefix != expected {
        return Err(BridgeError::Auth(
            "pairing nonce mismatch on accepted connection".to_string(),
        ));
    }
    Ok(())
}

async fn accept_assuan_loop(class: SocketClass, listener: TcpListener, nonce: Arc<Nonce>) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("{class} accept failed: {e}");
                break;
            }
        };
        debug!("{class} connection from {addr}");
        let nonce = nonce.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_assuan_connection(class, stream, &nonce).await {
                error!("{class} connection failed: {e}");
            }
        });
    }
}

async fn handle_assuan_connection(
    class: SocketClass,
    mut stream: TcpStream,
    nonce: &Nonce,
) -> Result<()> {
    authenticate(&mut stream, nonce).await?;

    // The Assuan descriptor is read only after authentication succeeds,
    // preserving the source's ordering: reading it earlier would fail
    // faster but would leak agent state to unauthenticated peers
    // (spec.md §9, ambiguity (iii)).
    let descriptor_path = assuan_descriptor_path(class).await?;
    let (port, assuan_nonce) = assuan::read_descriptor(&descriptor_path).await?;

    use tokio::io::AsyncWriteExt;
    let mut agent = TcpStream::connect(("127.0.0.1", port)).await?;
    agent.write_all(&assuan_nonce).await?;
    agent.flush().await?;

    splice::splice(&mut stream, &mut agent).await?;
    Ok(())
}

/// Resolves the descriptor file path for `class` by asking gpgconf for
/// the class's socket path, matching the teacher's approach to locating
/// the agent's advertised endpoint.
async fn assuan_descriptor_path(class: SocketClass) -> Result<PathBuf> {
    let output = tokio::process::Command::new("gpgconf")
        .arg("--list-dir")
        .arg(class.gpgconf_name())
        .output()
        .await
        .map_err(|e| BridgeError::Config(format!("failed to run gpgconf: {e}")))?;
    if !output.status.success() {
        return Err(BridgeError::Descriptor(format!(
            "gpgconf --list-dir {} failed: {}",
            class.gpgconf_name(),
            String::from_utf8_lossy(&output.stderr)
        )));
    }
    let path = String::from_utf8(output.stdout)
        .map_err(|e| BridgeError::Descriptor(format!("gpgconf output not UTF-8: {e}")))?;
    Ok(PathBuf::from(path.trim().replace('\\', "/")))
}

#[cfg(windows)]
async fn accept_ssh_loop(
    listener: TcpListener,
    nonce: Arc<Nonce>,
    adapter: Arc<crate::ssh_adapter::SshAdapter>,
) {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(pair) => pair,
            Err(e) => {
                warn!("AgentSsh accept failed: {e}");
                break;
            }
        };
        debug!("AgentSsh connection from {addr}");
        let nonce = nonce.clone();
        let adapter = adapter.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_ssh_connection(stream, &nonce, adapter).await {
                error!("AgentSsh connection failed: {e}");
            }
        });
    }
}

#[cfg(windows)]
async fn handle_ssh_connection(
    mut stream: TcpStream,
    nonce: &Nonce,
    adapter: Arc<crate::ssh_adapter::SshAdapter>,
) -> Result<()> {
    use crate::ssh_adapter::{PageantTransport, Win32Transport};
    use tokio::io::AsyncWriteExt;

    authenticate(&mut stream, nonce).await?;

    let mut buf = vec![0u8; 4096];
    loop {
        let n = stream.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        let request = buf[..n].to_vec();
        // The mapping slot is assigned per message, not per connection:
        // `SshAdapter::exchange` hands out a slot it has tracked as free,
        // so two connections active at once can never collide on the
        // same named mapping.
        let reply = adapter
            .exchange(&request, |slot| {
                Ok(Box::new(Win32Transport::new(slot)?) as Box<dyn PageantTransport>)
            })
            .await?;
        stream.write_all(&reply).await?;
    }
    Ok(())
}
