//! Logging setup: the `log` facade, backed by `env_logger` with an
//! explicit `Builder` so `log_level` and `logfile_path` from the
//! configuration record actually control output instead of only
//! `RUST_LOG`.

use std::fs::OpenOptions;
use std::io::Write;

use env_logger::Target;

use crate::config::Config;
use crate::error::{BridgeError, Result};

pub fn init(config: &Config) -> Result<()> {
    let mut builder = env_logger::Builder::new();
    builder.filter_level(config.log_level.to_level_filter());

    if let Some(path) = &config.logfile_path {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .map_err(|e| {
                BridgeError::Config(format!("cannot open logfile {}: {e}", path.display()))
            })?;
        builder.target(Target::Pipe(Box::new(file)));
    }

    builder.format(|buf, record| {
        writeln!(
            buf,
            "{} [{}] {}",
            chrono_like_timestamp(),
            record.level(),
            record.args()
        )
    });

    builder
        .try_init()
        .map_err(|e| BridgeError::Config(format!("logger already initialized: {e}")))
}

/// A coarse, dependency-free timestamp for log lines. The configuration
/// record's own logging concerns (level, destination) come from
/// `env_logger`; pulling in a full date/time crate just to prefix lines
/// with a clock reading would be disproportionate to what this adds.
fn chrono_like_timestamp() -> String {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    format!("{}.{:03}", now.as_secs(), now.subsec_millis())
}
