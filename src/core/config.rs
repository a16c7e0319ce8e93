use crate::core::Locator;
use crate::errors::{AutobookError, Result};
use crate::types::{FlowVariant, Viewport};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Everything the core needs, fixed at construction.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub flow: FlowVariant,
    pub browser: BrowserConfig,
    pub portal: PortalConfig,
    pub pacing: PacingConfig,
    pub retry: RetryConfig,
    pub alert: AlertConfig,
    pub observability: ObservabilityConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BrowserConfig {
    pub headless: bool,
    pub viewport: Viewport,
    pub profile_dir: PathBuf,
    pub chrome_path: Option<PathBuf>,
    pub locale: String,
    pub timezone: String,
    pub accept_language: String,
    pub args: Vec<String>,
    pub navigation_timeout_ms: u64,
    pub idle_timeout_ms: u64,
}

/// Inclusive range of milliseconds a randomized delay is drawn from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DelayRange {
    pub min_ms: u64,
    pub max_ms: u64,
}

impl DelayRange {
    pub const fn new(min_ms: u64, max_ms: u64) -> Self {
        Self { min_ms, max_ms }
    }

    pub const fn secs(min: u64, max: u64) -> Self {
        Self::new(min * 1000, max * 1000)
    }

    pub const fn zero() -> Self {
        Self::new(0, 0)
    }

    pub fn max(&self) -> Duration {
        Duration::from_millis(self.max_ms)
    }

    fn validate(&self, name: &str) -> Result<()> {
        if self.min_ms > self.max_ms {
            return Err(AutobookError::ConfigurationError(format!(
                "{}: min_ms {} is greater than max_ms {}",
                name, self.min_ms, self.max_ms
            )));
        }
        Ok(())
    }
}

/// Human-like pacing bands and per-action bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PacingConfig {
    pub micro: DelayRange,
    pub step: DelayRange,
    pub read: DelayRange,
    pub keystroke: DelayRange,
    pub slow_keystroke: DelayRange,
    pub keystroke_gap_ms: u64,
    pub slow_keystroke_gap_ms: u64,
    pub mouse_steps: (u32, u32),
    pub mouse_jitter_px: f64,
    pub locate_timeout_ms: u64,
    pub action_timeout_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Delay after a cycle that found nothing.
    pub retry: DelayRange,
    /// Delay after an anti-bot rejection.
    pub backoff: DelayRange,
    pub min_sleep_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AlertConfig {
    pub enabled: bool,
    /// Local audio file embedded as a data URL.
    pub audio_file: Option<PathBuf>,
    /// Used as-is when no file is given.
    pub audio_url: Option<String>,
    /// Length of the generated tone played when neither is set.
    pub tone_ms: u64,
    pub poll_interval_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ObservabilityConfig {
    pub screenshots: bool,
    pub shots_dir: PathBuf,
    pub clear_each_cycle: bool,
}

/// Site data for one portal: tokens, phrases and control descriptors.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PortalConfig {
    pub url: String,
    pub province: String,
    pub tramite_tokens: Vec<String>,
    pub tramite_related_tokens: Vec<String>,
    pub use_clave: bool,
    pub nie: NieConfig,
    pub tie: TieConfig,
    pub phrases: PhraseConfig,
    pub buttons: ButtonConfig,
    pub selectors: SelectorConfig,
    pub waits: WaitConfig,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct OfficeFilter {
    pub allow: Vec<String>,
    pub deny: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NieConfig {
    pub office: OfficeFilter,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TieConfig {
    pub office: OfficeFilter,
    pub section_phrases: Vec<String>,
    pub section_option: String,
}

/// Lower-case phrases; matching folds case and accents.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PhraseConfig {
    pub block_markers: Vec<String>,
    pub no_slots: Vec<String>,
    pub confirmation: Vec<String>,
    pub landing: Vec<String>,
    pub auth_mode: Vec<String>,
    pub tie_identity: Vec<String>,
}

/// Case-insensitive regexes for button/link labels.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ButtonConfig {
    pub enter: String,
    /// Generic accept/continue phrasings, tried in order.
    pub accept: Vec<String>,
    pub after_tramite: Vec<String>,
    pub request_appointment: String,
    pub auth_with_clave: String,
    pub auth_without_clave: String,
    pub continue_booking: Vec<String>,
    pub submit: Vec<String>,
    pub select_time: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SelectorConfig {
    pub province: Vec<Locator>,
    pub tramite: Vec<Locator>,
    pub office: Vec<Locator>,
    pub document_field: Vec<Locator>,
    pub name_field: Vec<Locator>,
    /// Presence of any of these marks the identity form.
    pub identity_anchors: Vec<Locator>,
    pub birth_year_field: Vec<Locator>,
    pub nationality: Vec<Locator>,
    pub nie_radio: Vec<Locator>,
    pub passport_radio: Vec<Locator>,
    /// Matches only when the passport radio is the checked one.
    pub passport_checked: Vec<Locator>,
    pub calendar: Vec<Locator>,
    pub calendar_days: Vec<Locator>,
    pub time_slots: Vec<Locator>,
    /// Fallbacks when no button is named like the request-appointment label.
    pub request_appointment: Vec<Locator>,
    pub cookie_bar: Vec<Locator>,
    pub cookie_accept: Vec<Locator>,
    pub phone_field: Vec<Locator>,
    pub email_fields: Vec<Vec<Locator>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaitConfig {
    pub province_ms: u64,
    pub tramite_ms: u64,
    pub auth_mode_ms: u64,
    pub identity_ms: u64,
    pub passport_checked_ms: u64,
    pub request_appointment_ms: u64,
    pub availability_ms: u64,
    /// How long an availability page showing neither a calendar nor a
    /// no-slots phrase is re-read before it counts as anomalous.
    pub availability_settle_ms: u64,
    pub confirmation_ms: u64,
}

fn strings(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

fn css_list(selectors: &[&str]) -> Vec<Locator> {
    selectors.iter().map(|s| Locator::css(*s)).collect()
}

impl Config {
    /// Defaults overridden by an optional TOML file.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(path) => {
                let raw = std::fs::read_to_string(path).map_err(|e| {
                    AutobookError::ConfigurationError(format!(
                        "cannot read {}: {}",
                        path.display(),
                        e
                    ))
                })?;
                Self::from_toml(&raw)?
            }
            None => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn from_toml(raw: &str) -> Result<Self> {
        Ok(toml::from_str(raw)?)
    }

    pub fn validate(&self) -> Result<()> {
        url::Url::parse(&self.portal.url).map_err(|e| {
            AutobookError::ConfigurationError(format!("portal.url '{}': {}", self.portal.url, e))
        })?;

        let pacing = &self.pacing;
        pacing.micro.validate("pacing.micro")?;
        pacing.step.validate("pacing.step")?;
        pacing.read.validate("pacing.read")?;
        pacing.keystroke.validate("pacing.keystroke")?;
        pacing.slow_keystroke.validate("pacing.slow_keystroke")?;
        if pacing.mouse_steps.0 == 0 || pacing.mouse_steps.0 > pacing.mouse_steps.1 {
            return Err(AutobookError::ConfigurationError(
                "pacing.mouse_steps must be a non-empty ascending range".to_string(),
            ));
        }
        self.retry.retry.validate("retry.retry")?;
        self.retry.backoff.validate("retry.backoff")?;

        let office = match self.flow {
            FlowVariant::Nie => &self.portal.nie.office,
            FlowVariant::Tie => &self.portal.tie.office,
        };
        if office.allow.is_empty() {
            return Err(AutobookError::ConfigurationError(format!(
                "{} office filter needs at least one allow token",
                self.flow
            )));
        }
        let alert = &self.alert;
        if alert.enabled && alert.audio_file.is_none() && alert.audio_url.is_none() && alert.tone_ms == 0 {
            return Err(AutobookError::ConfigurationError(
                "alert has no audio_file, no audio_url and tone_ms = 0; nothing would play".to_string(),
            ));
        }
        if self.portal.phrases.no_slots.is_empty() {
            return Err(AutobookError::ConfigurationError(
                "portal.phrases.no_slots must not be empty".to_string(),
            ));
        }
        Ok(())
    }

    pub fn office_filter(&self) -> &OfficeFilter {
        match self.flow {
            FlowVariant::Nie => &self.portal.nie.office,
            FlowVariant::Tie => &self.portal.tie.office,
        }
    }
}

impl PacingConfig {
    /// No pauses at all; keeps the bounds. Used by tests and dry runs.
    pub fn instant() -> Self {
        Self {
            micro: DelayRange::zero(),
            step: DelayRange::zero(),
            read: DelayRange::zero(),
            keystroke: DelayRange::zero(),
            slow_keystroke: DelayRange::zero(),
            keystroke_gap_ms: 0,
            slow_keystroke_gap_ms: 0,
            ..Self::default()
        }
    }

    pub fn locate_timeout(&self) -> Duration {
        Duration::from_millis(self.locate_timeout_ms)
    }

    pub fn action_timeout(&self) -> Duration {
        Duration::from_millis(self.action_timeout_ms)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Default for BrowserConfig {
    fn default() -> Self {
        Self {
            headless: false,
            viewport: Viewport {
                width: 1280,
                height: 900,
            },
            profile_dir: PathBuf::from("./chrome-profile"),
            chrome_path: None,
            locale: "es-ES".to_string(),
            timezone: "Europe/Madrid".to_string(),
            accept_language: "es-ES,es;q=0.9,en;q=0.8".to_string(),
            args: vec![],
            navigation_timeout_ms: 60000,
            idle_timeout_ms: 15 * 60 * 1000,
        }
    }
}

impl Default for PacingConfig {
    fn default() -> Self {
        Self {
            micro: DelayRange::new(300, 800),
            step: DelayRange::new(600, 1400),
            read: DelayRange::new(1200, 2600),
            keystroke: DelayRange::new(110, 190),
            slow_keystroke: DelayRange::new(200, 320),
            keystroke_gap_ms: 40,
            slow_keystroke_gap_ms: 80,
            mouse_steps: (8, 16),
            mouse_jitter_px: 3.0,
            locate_timeout_ms: 4000,
            action_timeout_ms: 8000,
            poll_interval_ms: 250,
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            retry: DelayRange::secs(2 * 60, 5 * 60),
            backoff: DelayRange::secs(7 * 60, 10 * 60),
            min_sleep_ms: 5000,
        }
    }
}

impl Default for AlertConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            audio_file: None,
            audio_url: None,
            tone_ms: 20000,
            poll_interval_ms: 1000,
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            screenshots: false,
            shots_dir: PathBuf::from("debug_shots"),
            clear_each_cycle: true,
        }
    }
}

impl Default for PortalConfig {
    fn default() -> Self {
        Self {
            url: "https://sede.administracionespublicas.gob.es/pagina/index/directorio/icpplus"
                .to_string(),
            province: "illes balears".to_string(),
            tramite_tokens: strings(&["certificado de registro", "ciudadano", "u.e"]),
            tramite_related_tokens: strings(&[
                "policía",
                "policia",
                "certificado",
                "registro",
                "u.e",
                "ue",
            ]),
            use_clave: false,
            nie: NieConfig::default(),
            tie: TieConfig::default(),
            phrases: PhraseConfig::default(),
            buttons: ButtonConfig::default(),
            selectors: SelectorConfig::default(),
            waits: WaitConfig::default(),
        }
    }
}

impl Default for NieConfig {
    fn default() -> Self {
        Self {
            office: OfficeFilter {
                allow: strings(&[
                    "mallorca",
                    "palma",
                    "palma de mallorca",
                    "inca",
                    "manacor",
                    "calvià",
                    "calvia",
                    "marratxí",
                    "marratxi",
                    "llucmajor",
                    "felanitx",
                    "alcúdia",
                    "alcudia",
                ]),
                deny: strings(&[
                    "menorca",
                    "maó",
                    "mao",
                    "ciutadella",
                    "ibiza",
                    "eivissa",
                    "formentera",
                    "sant antoni",
                ]),
            },
        }
    }
}

impl Default for TieConfig {
    fn default() -> Self {
        Self {
            office: OfficeFilter {
                allow: strings(&["oficina de extranjería de palma"]),
                deny: vec![],
            },
            section_phrases: strings(&["trámites oficinas de extranjería"]),
            section_option: "solicitud autorizac".to_string(),
        }
    }
}

impl Default for PhraseConfig {
    fn default() -> Self {
        Self {
            block_markers: strings(&["requested url was rejected", "support id is"]),
            no_slots: strings(&["no hay citas", "no existen citas disponibles"]),
            confirmation: strings(&["cita confirmada", "localizador", "resguardo"]),
            landing: strings(&["acceder al procedimiento"]),
            auth_mode: strings(&["presentación sin cl@ve", "presentación con cl@ve"]),
            tie_identity: strings(&["tipo de documento", "año de nacimiento"]),
        }
    }
}

impl Default for ButtonConfig {
    fn default() -> Self {
        Self {
            enter: "(acceder al procedimiento|entrar|acceder|iniciar)".to_string(),
            accept: strings(&["(aceptar|continuar|siguiente)", "(confirmar|enviar|guardar)"]),
            after_tramite: strings(&["(aceptar|continuar|solicitar cita|entrar|acceder)"]),
            request_appointment: r"solicitar\s*cita".to_string(),
            auth_with_clave: "presentaci[óo]n con cl@ve".to_string(),
            auth_without_clave: "presentaci[óo]n sin cl@ve".to_string(),
            continue_booking: strings(&["(continuar|siguiente|aceptar|confirmar)"]),
            submit: strings(&["(confirmar|reservar|finalizar|aceptar)", "(enviar|guardar)"]),
            select_time: "(seleccionar|cita)".to_string(),
        }
    }
}

impl Default for SelectorConfig {
    fn default() -> Self {
        Self {
            province: css_list(&[
                "select#form",
                "select[name*=provincia]",
                "select[id*=provincia]",
            ]),
            tramite: css_list(&[
                "select[id^=tramiteGrupo]",
                "select[name^=tramiteGrupo]",
                "select#subtramite",
                "select[name=subtramite]",
                "select[id*=tramite]",
                "select[name*=tramite]",
            ]),
            office: css_list(&[
                "select#sede",
                "select[name*=oficina]",
                "select[id*=oficina]",
                "select[name*=sede]",
            ]),
            document_field: css_list(&[
                "#txtIdCitado",
                "input[id*=pasap]",
                "input[name*=pasap]",
                "input[id*=documento]",
                "input[name*=documento]",
            ]),
            name_field: css_list(&["#txtDesCitado", "input[id*=nombre]", "input[name*=nombre]"]),
            identity_anchors: css_list(&["#txtIdCitado", "#txtDesCitado"]),
            birth_year_field: vec![
                Locator::near_text(["año de nacimiento"]),
                Locator::css("input[id*=anio]"),
                Locator::css("input[name*=anio]"),
                Locator::css("input[placeholder*=aaaa]"),
                Locator::css("input[id*=nacim]"),
                Locator::css("input[name*=nacim]"),
                Locator::css("input[maxlength='4']"),
            ],
            nationality: css_list(&["select#txtPaisNac", "select[name*=paisnac]", "select[id*=PaisNac]"]),
            nie_radio: css_list(&["#rdbTipoDocNie"]),
            passport_radio: vec![
                Locator::role("radio", "pasaport"),
                Locator::css("input[type=radio][id*=pasap]"),
                Locator::css("input[type=radio][value*=pasap]"),
                Locator::css("input[type=radio][name*=tipo][value=P]"),
                Locator::css("#rdbTipoDocPas"),
                Locator::label("pasaport"),
            ],
            passport_checked: css_list(&[
                "input[type=radio][checked][id*=pasap]",
                "input[type=radio][checked][value*=pasap]",
                "input[type=radio][checked][name*=tipo][value=P]",
                "#rdbTipoDocPas[checked]",
            ]),
            calendar: css_list(&[
                "table.ui-datepicker-calendar",
                "div.ui-datepicker",
                "div.datepicker",
                "div#calendar",
                "div[class*=calendar]",
            ]),
            calendar_days: css_list(&[
                "table.ui-datepicker-calendar td:not(.ui-datepicker-unselectable) a",
                "div.ui-datepicker td:not(.ui-datepicker-unselectable) a",
                "div.datepicker td:not(.disabled) a",
                "div#calendar td a",
                "div[class*=calendar] td a",
            ]),
            time_slots: css_list(&[
                "input[type=radio][name*=hora]",
                "input[type=radio][id*=hora]",
                "div.hora input[type=radio]",
            ]),
            request_appointment: css_list(&[
                "input[type=button][value*=Solicitar]",
                "input[type=submit][value*=Solicitar]",
            ]),
            cookie_bar: css_list(&["#cookie-law-info-bar"]),
            cookie_accept: css_list(&["#cookie_action_close_header"]),
            phone_field: css_list(&["#txtTelefonoCitado", "input[name*=telefono]"]),
            email_fields: vec![
                css_list(&["#emailUNO", "input[name=txtEmailCitado]"]),
                css_list(&["#emailDOS"]),
            ],
        }
    }
}

impl Default for WaitConfig {
    fn default() -> Self {
        Self {
            province_ms: 20000,
            tramite_ms: 15000,
            auth_mode_ms: 12000,
            identity_ms: 15000,
            passport_checked_ms: 4000,
            request_appointment_ms: 15000,
            availability_ms: 25000,
            availability_settle_ms: 10000,
            confirmation_ms: 15000,
        }
    }
}
