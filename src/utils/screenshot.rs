use crate::core::config::ObservabilityConfig;
use crate::core::PageDriver;
use crate::errors::Result;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Optional per-step full-page screenshots into one directory.
#[derive(Debug, Clone)]
pub struct ScreenshotRecorder {
    enabled: bool,
    dir: PathBuf,
}

impl ScreenshotRecorder {
    pub fn new(config: &ObservabilityConfig) -> Self {
        Self {
            enabled: config.screenshots,
            dir: config.shots_dir.clone(),
        }
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            dir: PathBuf::new(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Empty the directory, creating it if needed.
    pub async fn reset_dir(&self) -> Result<()> {
        if !self.enabled {
            return Ok(());
        }
        match tokio::fs::remove_dir_all(&self.dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::create_dir_all(&self.dir).await?;
        Ok(())
    }

    /// Save `<timestamp>-<tag>.png`. Failures are logged and swallowed.
    pub async fn snap(&self, page: &dyn PageDriver, tag: &str) -> Option<PathBuf> {
        if !self.enabled {
            return None;
        }
        match self.save(page, tag).await {
            Ok(path) => Some(path),
            Err(e) => {
                debug!(tag, error = %e, "screenshot skipped");
                None
            }
        }
    }

    async fn save(&self, page: &dyn PageDriver, tag: &str) -> Result<PathBuf> {
        let bytes = page.screenshot().await?;
        tokio::fs::create_dir_all(&self.dir).await?;
        let stamp = chrono::Local::now().format("%Y%m%d-%H%M%S%.3f");
        let path = self.dir.join(format!("{}-{}.png", stamp, sanitize(tag)));
        tokio::fs::write(&path, bytes).await?;
        Ok(path)
    }
}

fn sanitize(tag: &str) -> String {
    tag.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '-' })
        .collect()
}
