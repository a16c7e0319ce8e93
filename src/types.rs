use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Viewport {
    pub width: u32,
    pub height: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ElementRect {
    pub x: f64,
    pub y: f64,
    pub width: f64,
    pub height: f64,
}

impl ElementRect {
    pub fn contains(&self, x: f64, y: f64) -> bool {
        x >= self.x && x <= self.x + self.width && y >= self.y && y <= self.y + self.height
    }
}

/// One `<option>` of a `<select>`, as seen by the user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectOption {
    pub value: String,
    pub text: String,
}

impl SelectOption {
    pub fn new(value: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            value: value.into(),
            text: text.into(),
        }
    }
}

/// The two booking procedures sharing the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum FlowVariant {
    #[default]
    Nie,
    Tie,
}

impl fmt::Display for FlowVariant {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FlowVariant::Nie => write!(f, "NIE"),
            FlowVariant::Tie => write!(f, "TIE"),
        }
    }
}

impl FromStr for FlowVariant {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "NIE" => Ok(FlowVariant::Nie),
            "TIE" => Ok(FlowVariant::Tie),
            other => Err(format!("unknown flow variant '{}' (expected NIE or TIE)", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PageState {
    Landing,
    ProvinceSelect,
    TramiteSelect,
    AuthModeSelect,
    OfficeSelect,
    IdentityForm { variant: FlowVariant },
    Availability,
    Blocked,
    Confirmation,
    Unknown,
}

impl PageState {
    pub fn is_identity_form(&self) -> bool {
        matches!(self, PageState::IdentityForm { .. })
    }
}

impl fmt::Display for PageState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageState::IdentityForm { variant } => write!(f, "IdentityForm({})", variant),
            other => write!(f, "{:?}", other),
        }
    }
}

/// A page state together with the fragments that justified it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Classification {
    pub state: PageState,
    pub evidence: Vec<String>,
}

impl Classification {
    pub fn new(state: PageState, evidence: Vec<String>) -> Self {
        Self { state, evidence }
    }

    pub fn unknown() -> Self {
        Self::new(PageState::Unknown, Vec::new())
    }
}

/// Terminal result of one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AttemptOutcome {
    Booked,
    NotBooked,
    Blocked,
}

/// Sub-state of the availability page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Availability {
    Default,
    Anomalous,
}
