use std::process::ExitCode;

use clap::Parser;
use wsl_gpg_bridge::config::Config;
use wsl_gpg_bridge::lifecycle::{self, RunningCheck};
use wsl_gpg_bridge::logging;

fn main() -> ExitCode {
    let config = Config::parse();

    if let Some(pidfile) = &config.pidfile_path {
        if let RunningCheck::AlreadyRunning = lifecycle::check_already_running(pidfile) {
            // Idempotent start: another instance already owns this
            // pidfile (spec.md §4.5, §8).
            return ExitCode::SUCCESS;
        }
    }

    // Daemonizing must happen before the tokio runtime starts: forking a
    // process that already has multiple threads running is unsound.
    if config.daemonize {
        if let Err(e) = lifecycle::daemonize(config.pidfile_path.as_ref(), config.logfile_path.as_ref()) {
            eprintln!("{e}");
            return ExitCode::from(e.exit_code() as u8);
        }
    }

    if let Err(e) = logging::init(&config) {
        eprintln!("{e}");
        return ExitCode::from(e.exit_code() as u8);
    }

    if !config.daemonize {
        if let Some(pidfile) = &config.pidfile_path {
            if let Err(e) = lifecycle::write_pidfile(pidfile) {
                log::error!("{e}");
                return ExitCode::from(e.exit_code() as u8);
            }
        }
    }

    let pidfile_for_cleanup = config.pidfile_path.clone();

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("failed to start async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    let result = runtime.block_on(wsl_gpg_bridge::run(config));

    if let Some(pidfile) = &pidfile_for_cleanup {
        lifecycle::remove_pidfile(pidfile);
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("{e}");
            ExitCode::from(e.exit_code() as u8)
        }
    }
}
