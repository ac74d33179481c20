use std::{
    fs::OpenOptions,
    io::Write,
    path::{Path, PathBuf},
    sync::Arc,
};

use chrono::Local;
use tracing::{error, info, warn};

/// Append-only coded event log, mirrored to tracing. Two severities,
/// two files; entries look like `[M00] 2026-08-28 06:15:02 message`.
/// The log directory lives inside the upload directory but is exempt
/// from post-upload cleanup.
#[derive(Clone)]
pub struct EventLog {
    messages_path: Arc<PathBuf>,
    errors_path: Arc<PathBuf>,
}

impl EventLog {
    pub fn new(log_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(log_dir)?;
        Ok(Self {
            messages_path: Arc::new(log_dir.join("messages.log")),
            errors_path: Arc::new(log_dir.join("errors.log")),
        })
    }

    pub fn info(&self, code: &str, description: &str) {
        info!(code, "{description}");
        self.append(&self.messages_path, code, description);
    }

    pub fn error(&self, code: &str, description: &str) {
        error!(code, "{description}");
        self.append(&self.errors_path, code, description);
    }

    fn append(&self, path: &Path, code: &str, description: &str) {
        let stamp = Local::now().format("%Y-%m-%d %H:%M:%S");
        let entry = format!("[{code}] {stamp} {description}\n");

        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .and_then(|mut file| file.write_all(entry.as_bytes()));
        if let Err(err) = result {
            // The sink itself failing must never take the cycle down.
            warn!("event log write to {} failed: {err}", path.display());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn entries_are_coded_and_routed_by_severity() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        log.info("M00", "network connection successful");
        log.error("E00", "unable to connect to the internet");

        let messages = std::fs::read_to_string(dir.path().join("messages.log")).unwrap();
        let errors = std::fs::read_to_string(dir.path().join("errors.log")).unwrap();

        assert!(messages.starts_with("[M00] "));
        assert!(messages.trim_end().ends_with("network connection successful"));
        assert!(errors.starts_with("[E00] "));
        assert!(!messages.contains("unable to connect"));
    }

    #[test]
    fn appends_rather_than_truncates() {
        let dir = tempfile::tempdir().unwrap();
        let log = EventLog::new(dir.path()).unwrap();

        log.info("M00", "first");
        log.info("M01", "second");

        let messages = std::fs::read_to_string(dir.path().join("messages.log")).unwrap();
        assert_eq!(messages.lines().count(), 2);
    }
}
