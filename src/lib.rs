//! Bridges GPG and SSH agent traffic between a WSL2-like subsystem and a
//! native Windows GPG agent, as a pair of daemons: an inner bridge
//! running in the subsystem and an outer bridge running on Windows,
//! spawned by the inner bridge (see SPEC_FULL.md for the full design).

pub mod assuan;
pub mod config;
pub mod error;
#[cfg(unix)]
pub mod inner;
pub mod lifecycle;
pub mod logging;
pub mod nonce;
pub mod outer;
pub mod socket_class;
pub mod spawn;
pub mod splice;
#[cfg(windows)]
pub mod ssh_adapter;

pub use error::{BridgeError, Result};

use config::{Config, Mode};

/// Runs the bridge for the given, already-parsed configuration. Callers
/// are expected to have resolved the PID interlock and daemonization
/// (spec.md §4.5) before building the async runtime that calls this,
/// since forking after the runtime starts is unsound.
pub async fn run(config: Config) -> Result<()> {
    match config.mode {
        Mode::Inner => {
            #[cfg(unix)]
            {
                inner::start(config).await
            }
            #[cfg(not(unix))]
            {
                Err(BridgeError::Config(
                    "inner mode is only supported on the subsystem (Unix) side".to_string(),
                ))
            }
        }
        Mode::Outer => outer::start(config).await,
    }
}
