use crate::core::Locator;
use crate::dom::text;
use crate::types::SelectOption;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Which `<option>` an intent wants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptionChoice {
    /// Label contains the substring.
    Contains(String),
    /// Label contains every token.
    AllTokens(Vec<String>),
    /// Exact `value` attribute.
    Value(String),
}

impl OptionChoice {
    /// Options with an empty value are placeholders and never match.
    pub fn matches(&self, option: &SelectOption) -> bool {
        if option.value.is_empty() {
            return false;
        }
        match self {
            OptionChoice::Contains(needle) => text::contains_folded(&option.text, needle),
            OptionChoice::AllTokens(tokens) => text::contains_all(&option.text, tokens),
            OptionChoice::Value(value) => option.value == *value,
        }
    }
}

impl fmt::Display for OptionChoice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OptionChoice::Contains(needle) => write!(f, "contains '{}'", needle),
            OptionChoice::AllTokens(tokens) => write!(f, "all of {:?}", tokens),
            OptionChoice::Value(value) => write!(f, "value '{}'", value),
        }
    }
}

/// An abstract request for the resolver. Targets are ordered locator
/// lists; the first one that resolves wins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "intent", rename_all = "snake_case")]
pub enum ActionIntent {
    /// Click a button or link whose label matches a case-insensitive regex.
    ClickText { pattern: String },
    Click { target: Vec<Locator> },
    SelectOption {
        select: Vec<Locator>,
        choice: OptionChoice,
    },
    CheckRadio { target: Vec<Locator> },
    /// Type `text` exactly; succeeds only if the field reads back verbatim.
    TypeText {
        field: Vec<Locator>,
        text: String,
        label: String,
    },
    /// Assign by script with input/change events; read back like `TypeText`.
    SetValue {
        field: Vec<Locator>,
        value: String,
        label: String,
    },
}

impl ActionIntent {
    pub fn click_text(pattern: impl Into<String>) -> Self {
        ActionIntent::ClickText {
            pattern: pattern.into(),
        }
    }

    pub fn click(target: Vec<Locator>) -> Self {
        ActionIntent::Click { target }
    }

    pub fn select(select: Vec<Locator>, choice: OptionChoice) -> Self {
        ActionIntent::SelectOption { select, choice }
    }

    pub fn check(target: Vec<Locator>) -> Self {
        ActionIntent::CheckRadio { target }
    }

    pub fn type_text(field: Vec<Locator>, text: impl Into<String>, label: impl Into<String>) -> Self {
        ActionIntent::TypeText {
            field,
            text: text.into(),
            label: label.into(),
        }
    }

    pub fn set_value(field: Vec<Locator>, value: impl Into<String>, label: impl Into<String>) -> Self {
        ActionIntent::SetValue {
            field,
            value: value.into(),
            label: label.into(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            ActionIntent::ClickText { .. } => "click_text",
            ActionIntent::Click { .. } => "click",
            ActionIntent::SelectOption { .. } => "select_option",
            ActionIntent::CheckRadio { .. } => "check_radio",
            ActionIntent::TypeText { .. } => "type_text",
            ActionIntent::SetValue { .. } => "set_value",
        }
    }
}

/// Result of performing an intent. Failures are values, never errors.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionOutcome {
    pub success: bool,
    pub diagnostic: Option<String>,
    /// Name of the strategy that succeeded.
    pub strategy: Option<String>,
    pub data: Option<serde_json::Value>,
    pub execution_time_ms: u64,
}

impl ActionOutcome {
    pub fn success(strategy: impl Into<String>) -> Self {
        Self {
            success: true,
            diagnostic: None,
            strategy: Some(strategy.into()),
            data: None,
            execution_time_ms: 0,
        }
    }

    pub fn success_with_data(strategy: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            data: Some(data),
            ..Self::success(strategy)
        }
    }

    pub fn failure(diagnostic: impl Into<String>) -> Self {
        Self {
            success: false,
            diagnostic: Some(diagnostic.into()),
            strategy: None,
            data: None,
            execution_time_ms: 0,
        }
    }

    pub fn with_execution_time(mut self, time_ms: u64) -> Self {
        self.execution_time_ms = time_ms;
        self
    }
}
