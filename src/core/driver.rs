use crate::errors::Result;
use crate::types::{ElementRect, SelectOption};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;

/// How to find elements on the live page.
///
/// A logical control (the province select, the passport radio...) is a
/// `Vec<Locator>` tried in order, so supporting a new portal layout means
/// adding a descriptor, not a branch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Locator {
    /// Plain CSS selector.
    Css { selector: String },
    /// Accessible role plus a case-insensitive regex over the accessible name.
    Role { role: String, name: String },
    /// Case-insensitive regex over the visible text of an element.
    Text { pattern: String },
    /// First visible, enabled text input after the node whose folded text
    /// contains one of `phrases`.
    NearText { phrases: Vec<String> },
    /// First element matching `selector` that follows, in document order,
    /// the node whose folded text contains one of `phrases`.
    AfterText {
        phrases: Vec<String>,
        selector: String,
    },
    /// Control associated with a `<label>` whose text matches `pattern`.
    Label { pattern: String },
}

impl Locator {
    pub fn css(selector: impl Into<String>) -> Self {
        Locator::Css {
            selector: selector.into(),
        }
    }

    pub fn role(role: impl Into<String>, name: impl Into<String>) -> Self {
        Locator::Role {
            role: role.into(),
            name: name.into(),
        }
    }

    pub fn text(pattern: impl Into<String>) -> Self {
        Locator::Text {
            pattern: pattern.into(),
        }
    }

    pub fn near_text<S: Into<String>>(phrases: impl IntoIterator<Item = S>) -> Self {
        Locator::NearText {
            phrases: phrases.into_iter().map(Into::into).collect(),
        }
    }

    pub fn after_text<S: Into<String>>(
        phrases: impl IntoIterator<Item = S>,
        selector: impl Into<String>,
    ) -> Self {
        Locator::AfterText {
            phrases: phrases.into_iter().map(Into::into).collect(),
            selector: selector.into(),
        }
    }

    pub fn label(pattern: impl Into<String>) -> Self {
        Locator::Label {
            pattern: pattern.into(),
        }
    }
}

impl fmt::Display for Locator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Locator::Css { selector } => write!(f, "css={}", selector),
            Locator::Role { role, name } => write!(f, "role={}[name=/{}/i]", role, name),
            Locator::Text { pattern } => write!(f, "text=/{}/i", pattern),
            Locator::NearText { phrases } => write!(f, "near-text={:?}", phrases),
            Locator::AfterText { phrases, selector } => {
                write!(f, "after-text={:?} >> {}", phrases, selector)
            }
            Locator::Label { pattern } => write!(f, "label=/{}/i", pattern),
        }
    }
}

/// Opaque handle to an element found by [`PageDriver::locate`].
///
/// Handles are only valid until the page changes; drivers answer
/// [`AutobookError::StaleElement`](crate::errors::AutobookError::StaleElement)
/// for handles that no longer resolve.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ElementRef(pub String);

impl fmt::Display for ElementRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The browser capabilities the engine consumes.
///
/// Every call acts on the session's single page and none of them may be
/// issued concurrently.
#[async_trait]
pub trait PageDriver: Send + Sync {
    /// Navigate and wait for the DOM to be ready.
    async fn navigate(&self, url: &str) -> Result<()>;

    /// Serialized DOM with live `value`/`checked` state mirrored into attributes.
    async fn content(&self) -> Result<String>;

    /// Rendered text of the body.
    async fn body_text(&self) -> Result<String>;

    /// Zero or more elements matching the locator, in document order.
    async fn locate(&self, locator: &Locator) -> Result<Vec<ElementRef>>;

    /// Viewport box of a visible element, `None` if it is not rendered.
    async fn bounding_box(&self, element: &ElementRef) -> Result<Option<ElementRect>>;

    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()>;

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()>;

    /// Press and release the primary button at a viewport point.
    async fn mouse_click(&self, x: f64, y: f64) -> Result<()>;

    async fn mouse_wheel(&self, delta_y: f64) -> Result<()>;

    /// Forced click that skips actionability checks.
    async fn click(&self, element: &ElementRef) -> Result<()>;

    async fn focus(&self, element: &ElementRef) -> Result<()>;

    /// Press a key or chord on the focused element, e.g. `"Delete"` or `"Control+A"`.
    async fn press_key(&self, key: &str) -> Result<()>;

    /// Send one keystroke to the focused element.
    async fn type_char(&self, ch: char) -> Result<()>;

    /// Insert text into the focused element without key events.
    async fn insert_text(&self, text: &str) -> Result<()>;

    async fn input_value(&self, element: &ElementRef) -> Result<String>;

    /// Assign `value` by script and fire `input`/`change`.
    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<()>;

    async fn select_options(&self, element: &ElementRef) -> Result<Vec<SelectOption>>;

    async fn select_option(&self, element: &ElementRef, value: &str) -> Result<()>;

    /// Set `checked = true` by script, fire `input`/`change`, and report the
    /// resulting `checked` property.
    async fn set_checked(&self, element: &ElementRef) -> Result<bool>;

    async fn is_checked(&self, element: &ElementRef) -> Result<bool>;

    async fn evaluate(&self, script: &str, await_promise: bool) -> Result<Value>;

    /// Full-page PNG.
    async fn screenshot(&self) -> Result<Vec<u8>>;

    async fn close(&self) -> Result<()>;
}
