use crate::browser::chrome::{attach_console_logging, ChromeDriver};
use crate::core::config::BrowserConfig;
use crate::core::{BrowserSession, PageDriver, SessionFactory};
use crate::errors::{AutobookError, Result};
use async_trait::async_trait;
use headless_chrome::protocol::cdp::Emulation;
use headless_chrome::{Browser, LaunchOptions, Tab};
use std::collections::HashMap;
use std::ffi::OsStr;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Defaults headless_chrome passes to Chrome that announce automation.
const AUTOMATION_DEFAULT_ARGS: &[&str] = &["--enable-automation"];

/// Launches one persistent-profile Chrome per cycle.
pub struct ChromeSessionFactory {
    config: BrowserConfig,
}

impl ChromeSessionFactory {
    pub fn new(config: BrowserConfig) -> Self {
        Self { config }
    }

    fn launch_args(&self) -> Vec<String> {
        let mut args = vec![
            "--no-sandbox".to_string(),
            "--disable-dev-shm-usage".to_string(),
            "--no-first-run".to_string(),
            "--no-default-browser-check".to_string(),
            "--disable-blink-features=AutomationControlled".to_string(),
            "--disable-infobars".to_string(),
            "--autoplay-policy=no-user-gesture-required".to_string(),
            format!("--lang={}", self.config.locale),
        ];
        args.extend(self.config.args.iter().cloned());
        args
    }
}

/// Start Chrome and prepare its first tab. Blocking; runs off the runtime.
fn launch(config: &BrowserConfig, args: &[String]) -> Result<(Browser, Arc<Tab>)> {
    std::fs::create_dir_all(&config.profile_dir)?;

    let launch_options = LaunchOptions {
        headless: config.headless,
        window_size: Some((config.viewport.width, config.viewport.height)),
        path: config.chrome_path.clone(),
        user_data_dir: Some(config.profile_dir.clone()),
        args: args.iter().map(OsStr::new).collect(),
        ignore_default_args: AUTOMATION_DEFAULT_ARGS.iter().map(OsStr::new).collect(),
        idle_browser_timeout: Duration::from_millis(config.idle_timeout_ms),
        ..Default::default()
    };

    let browser = Browser::new(launch_options).map_err(|e| AutobookError::LaunchFailed(e.to_string()))?;
    let tab = browser
        .new_tab()
        .map_err(|e| AutobookError::LaunchFailed(e.to_string()))?;

    // Locale and timezone must match a browser in Spain; failures here
    // degrade fingerprint quality but do not stop the cycle.
    if let Err(e) = tab.call_method(Emulation::SetTimezoneOverride {
        timezone_id: config.timezone.clone(),
    }) {
        warn!(error = %e, "timezone override failed");
    }
    if let Err(e) = tab.call_method(Emulation::SetLocaleOverride {
        locale: Some(config.locale.clone()),
    }) {
        warn!(error = %e, "locale override failed");
    }
    let mut headers = HashMap::new();
    headers.insert("Accept-Language", config.accept_language.as_str());
    if let Err(e) = tab.set_extra_http_headers(headers) {
        warn!(error = %e, "accept-language header failed");
    }
    if let Err(e) = attach_console_logging(&tab) {
        warn!(error = %e, "page console will not be logged");
    }
    tab.set_default_timeout(Duration::from_millis(config.navigation_timeout_ms));
    Ok((browser, tab))
}

#[async_trait]
impl SessionFactory for ChromeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        let config = self.config.clone();
        let args = self.launch_args();
        let (browser, tab) = tokio::task::spawn_blocking(move || launch(&config, &args))
            .await
            .map_err(|e| AutobookError::LaunchFailed(e.to_string()))??;

        let session = ChromeSession {
            id: uuid::Uuid::new_v4().to_string(),
            _browser: browser,
            page: Arc::new(ChromeDriver::new(tab)),
        };
        info!(session = %session.id, profile = %self.config.profile_dir.display(), "browser session opened");
        Ok(Box::new(session))
    }
}

pub struct ChromeSession {
    id: String,
    // Dropping the browser ends the Chrome process and frees the profile.
    _browser: Browser,
    page: Arc<ChromeDriver>,
}

#[async_trait]
impl BrowserSession for ChromeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn page(&self) -> Arc<dyn PageDriver> {
        self.page.clone()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        let closed = self.page.close().await;
        info!(session = %self.id, "browser session closed");
        drop(self);
        closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_args_hide_automation() {
        let mut config = BrowserConfig::default();
        config.args = vec!["--mute-audio".to_string()];
        let args = ChromeSessionFactory::new(config).launch_args();
        assert!(args.contains(&"--disable-blink-features=AutomationControlled".to_string()));
        assert!(args.contains(&"--autoplay-policy=no-user-gesture-required".to_string()));
        assert_eq!(args.last().map(String::as_str), Some("--mute-audio"));
        assert!(!args.iter().any(|a| a == "--enable-automation"));
    }
}
