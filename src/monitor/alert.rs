use crate::core::config::AlertConfig;
use crate::core::PageDriver;
use crate::errors::{AutobookError, Result};
use crate::utils::javascript::{ALARM_ENDED, ALARM_START};
use crate::utils::JavaScriptRunner;
use async_trait::async_trait;
use base64::{engine::general_purpose, Engine as _};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

const ALARM_ELEMENT_ID: &str = "__cita_alarm__";

/// What the page reported after trying to start playback.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AlertDiagnostics {
    pub ok: bool,
    pub created: bool,
    #[serde(rename = "hadElem")]
    pub had_element: bool,
    pub ready_state: i64,
    pub paused: bool,
    pub current_time: f64,
    pub error: Option<String>,
    pub events: Vec<String>,
    pub src_prefix: String,
}

impl AlertDiagnostics {
    fn failed(reason: impl Into<String>) -> Self {
        Self {
            error: Some(reason.into()),
            paused: true,
            ..Self::default()
        }
    }
}

/// Audible notification played inside the page.
#[async_trait]
pub trait Alarm: Send + Sync {
    /// Start playback. Never fails; problems are reported in the diagnostics.
    async fn start(&self, page: &dyn PageDriver) -> AlertDiagnostics;

    async fn has_ended(&self, page: &dyn PageDriver) -> Result<bool>;
}

/// Plays a clip through an injected `<audio>` element, or a WebAudio beep
/// of `tone_ms` when no clip is configured.
pub struct PageAudioAlarm {
    enabled: bool,
    source: Option<String>,
    tone_ms: u64,
}

impl PageAudioAlarm {
    pub fn from_config(config: &AlertConfig) -> Result<Self> {
        let source = match (&config.audio_file, &config.audio_url) {
            (Some(file), _) => Some(data_url_for_audio(file)?),
            (None, Some(url)) => Some(url.clone()),
            (None, None) => None,
        };
        if source.is_none() && config.enabled {
            info!(tone_ms = config.tone_ms, "no alarm clip configured, using a generated tone");
        }
        Ok(Self {
            enabled: config.enabled,
            source,
            tone_ms: config.tone_ms,
        })
    }

    pub fn disabled() -> Self {
        Self {
            enabled: false,
            source: None,
            tone_ms: 0,
        }
    }

    pub fn uses_tone(&self) -> bool {
        self.enabled && self.source.is_none()
    }
}

#[async_trait]
impl Alarm for PageAudioAlarm {
    async fn start(&self, page: &dyn PageDriver) -> AlertDiagnostics {
        if !self.enabled {
            return AlertDiagnostics::failed("alarm disabled");
        }
        let script = match JavaScriptRunner::alarm_script(
            ALARM_START,
            ALARM_ELEMENT_ID,
            self.source.as_deref(),
            self.tone_ms,
        ) {
            Ok(script) => script,
            Err(e) => return AlertDiagnostics::failed(e.to_string()),
        };
        let diagnostics = match JavaScriptRunner::run_async_with_timeout(page, &script, Duration::from_secs(10)).await {
            Ok(value) => serde_json::from_value(value)
                .unwrap_or_else(|e| AlertDiagnostics::failed(format!("unreadable diagnostics: {}", e))),
            Err(e) => AlertDiagnostics::failed(e.to_string()),
        };
        if diagnostics.ok {
            info!(events = ?diagnostics.events, "alarm playing");
        } else {
            warn!(error = ?diagnostics.error, ready_state = diagnostics.ready_state, "alarm did not start");
        }
        diagnostics
    }

    async fn has_ended(&self, page: &dyn PageDriver) -> Result<bool> {
        if !self.enabled {
            return Ok(true);
        }
        let script = JavaScriptRunner::alarm_script(ALARM_ENDED, ALARM_ELEMENT_ID, None, self.tone_ms)?;
        let value = JavaScriptRunner::run(page, &script).await?;
        Ok(value.as_bool().unwrap_or(false))
    }
}

/// Read an audio file into a `data:` URL so the page needs no file access.
pub fn data_url_for_audio(path: &Path) -> Result<String> {
    let mime = match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("mp3") => "audio/mpeg",
        Some("wav") => "audio/wav",
        Some("ogg") | Some("oga") => "audio/ogg",
        Some("m4a") | Some("mp4") => "audio/mp4",
        Some("aac") => "audio/aac",
        Some("webm") => "audio/webm",
        Some("flac") => "audio/flac",
        _ => {
            return Err(AutobookError::ConfigurationError(format!(
                "unsupported alarm audio format: {}",
                path.display()
            )))
        }
    };
    let bytes = std::fs::read(path).map_err(|e| {
        AutobookError::ConfigurationError(format!("cannot read {}: {}", path.display(), e))
    })?;
    Ok(format!("data:{};base64,{}", mime, general_purpose::STANDARD.encode(bytes)))
}
