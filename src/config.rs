//! The configuration record supplied by the CLI collaborator. All fields
//! are immutable after startup.

use std::path::PathBuf;

use clap::{Parser, ValueEnum};

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Mode {
    Inner,
    Outer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, ValueEnum)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    pub fn to_level_filter(self) -> log::LevelFilter {
        match self {
            LogLevel::Debug => log::LevelFilter::Debug,
            LogLevel::Info => log::LevelFilter::Info,
            LogLevel::Warn => log::LevelFilter::Warn,
            LogLevel::Error | LogLevel::Fatal => log::LevelFilter::Error,
            LogLevel::Unknown => log::LevelFilter::Info,
        }
    }
}

/// Bridges GPG and SSH agent sockets between a WSL2 subsystem and a
/// native Windows GPG agent.
#[derive(Parser, Debug, Clone)]
#[command(name = "wsl-gpg-bridge", version, about)]
pub struct Config {
    /// Selects the inner (subsystem) or outer (Windows) role.
    #[arg(long, value_enum)]
    pub mode: Mode,

    /// Address the inner bridge uses to reach the outer bridge.
    #[arg(long, default_value = "127.0.0.1")]
    pub remote_address: String,

    /// Bind address on the host (outer) side.
    #[arg(long, default_value = "0.0.0.0")]
    pub windows_address: String,

    /// First of the 3 or 4 contiguous TCP ports between inner and outer.
    #[arg(long, default_value_t = 6910)]
    pub base_port: u16,

    /// Include the AgentSsh class (adds port `base_port + 3`).
    #[arg(long)]
    pub enable_ssh: bool,

    /// Shared-nonce file; defaults under the agent's home directory.
    #[arg(long)]
    pub noncefile_path: Option<PathBuf>,

    /// Append target for logging and redirected std streams.
    #[arg(long)]
    pub logfile_path: Option<PathBuf>,

    /// PID-file interlock path.
    #[arg(long)]
    pub pidfile_path: Option<PathBuf>,

    /// Detach from the controlling terminal and redirect std streams.
    #[arg(long)]
    pub daemonize: bool,

    /// Logging verbosity.
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LogLevel,

    /// Forwarded to the outer bridge's `--logfile-path` when the inner
    /// spawns it; distinct from the inner's own `logfile_path`.
    #[arg(long)]
    pub windows_logfile_path: Option<String>,

    /// Forwarded to the outer bridge's `--pidfile-path` when the inner
    /// spawns it.
    #[arg(long)]
    pub windows_pidfile_path: Option<String>,
}

impl Config {
    /// Default nonce file path: under the agent's reported home directory,
    /// in a dotfile mirroring the toolchain's own descriptor files.
    pub fn resolved_noncefile_path(&self) -> PathBuf {
        if let Some(p) = &self.noncefile_path {
            return p.clone();
        }
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        home.join(".gnupg").join("wsl-gpg-bridge.nonce")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_levels_map_to_filters() {
        assert_eq!(LogLevel::Debug.to_level_filter(), log::LevelFilter::Debug);
        assert_eq!(LogLevel::Fatal.to_level_filter(), log::LevelFilter::Error);
    }
}
