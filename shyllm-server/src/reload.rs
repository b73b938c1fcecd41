//! Auto-reload on rebuild
//!
//! The server watches its own executable and stops when the file on disk
//! changes, so the bootstrap can relaunch the fresh build.

use std::path::{Path, PathBuf};
use std::process::{Command, ExitCode};
use std::time::{Duration, SystemTime};
use tracing::{info, warn};

pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(1);

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Resolves once the modification time of `path` differs from the one seen
/// when polling started. Transient metadata errors (e.g. the file being
/// replaced) are ignored.
pub async fn file_changed(path: PathBuf, poll: Duration) {
    let baseline = modified(&path);
    let mut ticker = tokio::time::interval(poll);
    ticker.tick().await;
    loop {
        ticker.tick().await;
        match modified(&path) {
            Some(current) if Some(current) != baseline => {
                info!("Detected change in {}", path.display());
                return;
            }
            _ => {}
        }
    }
}

/// Resolves when the running executable is rebuilt. Never resolves if the
/// executable path cannot be determined.
pub async fn executable_changed(poll: Duration) {
    match std::env::current_exe() {
        Ok(path) => file_changed(path, poll).await,
        Err(e) => {
            warn!("Auto-reload disabled, cannot locate executable: {}", e);
            std::future::pending::<()>().await
        }
    }
}

/// Command that starts the current executable with the same arguments.
pub fn relaunch_command() -> std::io::Result<Command> {
    let exe = std::env::current_exe()?;
    let mut command = Command::new(exe);
    command.args(std::env::args_os().skip(1));
    Ok(command)
}

/// Replace this process with a fresh copy of the executable.
///
/// Only returns if the exec itself fails.
#[cfg(unix)]
pub fn relaunch() -> anyhow::Result<ExitCode> {
    use std::os::unix::process::CommandExt;

    let mut command = relaunch_command()?;
    info!("Reloading {}", command.get_program().to_string_lossy());
    let err = command.exec();
    Err(anyhow::Error::new(err).context("failed to exec the rebuilt server"))
}

/// Run a fresh copy of the executable and exit with its status.
#[cfg(not(unix))]
pub fn relaunch() -> anyhow::Result<ExitCode> {
    let mut command = relaunch_command()?;
    info!("Reloading {}", command.get_program().to_string_lossy());
    let status = command.status()?;
    let code = status
        .code()
        .and_then(|c| u8::try_from(c).ok())
        .unwrap_or(1);
    Ok(ExitCode::from(code))
}
