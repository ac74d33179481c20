use std::{io::ErrorKind, path::PathBuf, sync::Arc};

use tokio::sync::Mutex;
use tracing::warn;

use fieldstation_common::StationConfig;

/// Persistent, operator-editable station configuration. Credentials are
/// re-read from here on every connectivity attempt and calibration
/// values are written back after each imaging step, so all access goes
/// through one lock.
#[derive(Clone)]
pub struct ConfigStore {
    path: Arc<PathBuf>,
    lock: Arc<Mutex<()>>,
}

impl ConfigStore {
    pub fn new(path: PathBuf) -> Self {
        Self {
            path: Arc::new(path),
            lock: Arc::new(Mutex::new(())),
        }
    }

    /// A file that fails to parse (a power cut mid-write, a botched
    /// hand edit) degrades to defaults rather than taking the cycle
    /// down; only real I/O errors propagate.
    pub async fn load(&self) -> anyhow::Result<StationConfig> {
        let _guard = self.lock.lock().await;
        let mut config = match tokio::fs::read(self.path.as_ref()).await {
            Ok(raw) => match serde_json::from_slice::<StationConfig>(&raw) {
                Ok(config) => config,
                Err(err) => {
                    warn!("config file unreadable, using defaults: {err}");
                    StationConfig::default()
                }
            },
            Err(err) if err.kind() == ErrorKind::NotFound => StationConfig::default(),
            Err(err) => return Err(err.into()),
        };
        config.sanitize();
        Ok(config)
    }

    /// Write-to-temp-then-rename, so a power cut mid-save leaves the
    /// previous file intact.
    pub async fn save(&self, config: &StationConfig) -> anyhow::Result<()> {
        let _guard = self.lock.lock().await;
        let path = self.path.as_ref().clone();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let payload = serde_json::to_vec_pretty(config)?;
        let temp_path = path.with_extension("json.tmp");
        tokio::fs::write(&temp_path, payload).await?;
        tokio::fs::rename(&temp_path, path).await?;
        Ok(())
    }

    /// Store the operator-submitted credentials, leaving every other
    /// section untouched.
    pub async fn update_credentials(&self, ssid: &str, password: &str) -> anyhow::Result<()> {
        let mut config = self.load().await?;
        config.network.ssid = ssid.to_string();
        config.network.password = password.to_string();
        self.save(&config).await
    }

    /// Flip the priority-connect flag, returning the new value.
    pub async fn toggle_priority(&self) -> anyhow::Result<bool> {
        let mut config = self.load().await?;
        config.network.priority = !config.network.priority;
        let updated = config.network.priority;
        self.save(&config).await?;
        Ok(updated)
    }
}
