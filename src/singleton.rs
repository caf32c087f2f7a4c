//! Single-instance guard and the file-based stop sentinel.
//!
//! A `bot.pid` file in the state dir marks a running instance; a second
//! process refuses to start while it exists. `stop.flag` is the graceful
//! shutdown request: any local tool (or the /stop command) creates it and
//! the runner consumes it at the top of the next iteration.

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{info, warn};

const PID_FILE: &str = "bot.pid";
const STOP_FILE: &str = "stop.flag";

#[derive(Debug, Error)]
pub enum SingletonError {
    #[error("another instance appears to be running (pid {0}); remove bot.pid if it is stale")]
    AlreadyRunning(String),
    #[error("pid file io: {0}")]
    Io(#[from] std::io::Error),
}

pub struct ProcessSingleton {
    pid_path: PathBuf,
    stop_path: PathBuf,
    held: bool,
}

impl ProcessSingleton {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            pid_path: state_dir.join(PID_FILE),
            stop_path: state_dir.join(STOP_FILE),
            held: false,
        }
    }

    /// Claim the instance lock, refusing if a pid file already exists.
    /// A stale file from a crashed run must be removed by the operator;
    /// guessing about liveness risks two live traders.
    pub fn acquire(&mut self) -> Result<(), SingletonError> {
        if self.pid_path.exists() {
            let pid = std::fs::read_to_string(&self.pid_path)
                .unwrap_or_else(|_| "unreadable".to_string());
            return Err(SingletonError::AlreadyRunning(pid.trim().to_string()));
        }
        std::fs::write(&self.pid_path, std::process::id().to_string())?;
        self.held = true;
        info!(pid = std::process::id(), path = %self.pid_path.display(), "instance lock acquired");
        Ok(())
    }

    /// Whether the pid file on disk names this process. Conflict handling
    /// checks this before deciding whether to keep polling.
    pub fn owned_by_current_process(&self) -> bool {
        match std::fs::read_to_string(&self.pid_path) {
            Ok(pid) => pid.trim() == std::process::id().to_string(),
            Err(_) => false,
        }
    }

    pub fn release(&mut self) {
        if !self.held {
            return;
        }
        if let Err(e) = std::fs::remove_file(&self.pid_path) {
            warn!(error = %e, "failed to remove pid file");
        }
        self.held = false;
    }

    pub fn stop_requested(&self) -> bool {
        self.stop_path.exists()
    }

    /// Consume the stop flag so the next start is clean.
    pub fn clear_stop(&self) {
        match std::fs::remove_file(&self.stop_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => warn!(error = %e, "failed to remove stop flag"),
        }
    }

    pub fn request_stop(&self) -> std::io::Result<()> {
        std::fs::write(&self.stop_path, "stop requested\n")
    }
}

impl Drop for ProcessSingleton {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn second_instance_is_refused() {
        let dir = TempDir::new().unwrap();
        let mut first = ProcessSingleton::new(dir.path());
        first.acquire().unwrap();
        assert!(first.owned_by_current_process());

        let mut second = ProcessSingleton::new(dir.path());
        let err = second.acquire().unwrap_err();
        assert!(matches!(err, SingletonError::AlreadyRunning(_)));
    }

    #[test]
    fn release_allows_reacquire() {
        let dir = TempDir::new().unwrap();
        let mut first = ProcessSingleton::new(dir.path());
        first.acquire().unwrap();
        first.release();

        let mut second = ProcessSingleton::new(dir.path());
        assert!(second.acquire().is_ok());
    }

    #[test]
    fn stop_flag_round_trip() {
        let dir = TempDir::new().unwrap();
        let guard = ProcessSingleton::new(dir.path());
        assert!(!guard.stop_requested());
        guard.request_stop().unwrap();
        assert!(guard.stop_requested());
        guard.clear_stop();
        assert!(!guard.stop_requested());
    }

    #[test]
    fn drop_removes_pid_file() {
        let dir = TempDir::new().unwrap();
        {
            let mut guard = ProcessSingleton::new(dir.path());
            guard.acquire().unwrap();
        }
        let mut again = ProcessSingleton::new(dir.path());
        assert!(again.acquire().is_ok());
    }
}
