//! Scriptable stand-ins for the browser collaborators.
//!
//! [`FakePage`] renders a flat list of [`FakeElement`]s as HTML, resolves
//! locators against it and applies clicks, keystrokes and scripts to its
//! own state, so resolver, engine and supervisor behaviour can be exercised
//! without a browser.

use crate::core::{BrowserSession, ElementRef, Locator, PageDriver, SessionFactory};
use crate::dom::text::{contains_any, fold};
use crate::errors::{AutobookError, Result};
use crate::monitor::alert::{AlertDiagnostics, Alarm};
use crate::types::{ElementRect, SelectOption};
use async_trait::async_trait;
use regex::{Regex, RegexBuilder};
use scraper::{Html, Selector};
use serde_json::Value;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::time::Instant;

/// How an input reacts to text entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Typing {
    Accepts,
    /// Upper-cases everything entered, like the portal's keyup handlers.
    Uppercases,
    /// Drops keystrokes but accepts inserted text.
    RejectsKeystrokes,
    /// Nothing entered sticks.
    RejectsAll,
}

/// What clicking an element does to the page.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Transition {
    To(usize),
    /// Go to `then` when radio `radio` is checked, else to `otherwise`.
    IfChecked {
        radio: String,
        then: usize,
        otherwise: usize,
    },
}

#[derive(Debug, Clone)]
pub struct FakeElement {
    pub tag: String,
    pub id: Option<String>,
    pub name: Option<String>,
    pub input_type: Option<String>,
    pub text: String,
    pub classes: Vec<String>,
    pub attrs: Vec<(String, String)>,
    pub options: Vec<SelectOption>,
    pub value: String,
    pub checked: bool,
    pub visible: bool,
    pub disabled: bool,
    pub typing: Typing,
    pub script_check_sticks: bool,
    pub on_click: Option<Transition>,
    /// Radio checked as a side effect of focusing this element.
    pub on_focus_check: Option<String>,
    pub label: Option<String>,
    pub wrap: Option<(String, String)>,
}

impl FakeElement {
    pub fn new(tag: &str) -> Self {
        Self {
            tag: tag.to_string(),
            id: None,
            name: None,
            input_type: None,
            text: String::new(),
            classes: Vec::new(),
            attrs: Vec::new(),
            options: Vec::new(),
            value: String::new(),
            checked: false,
            visible: true,
            disabled: false,
            typing: Typing::Accepts,
            script_check_sticks: true,
            on_click: None,
            on_focus_check: None,
            label: None,
            wrap: None,
        }
    }

    pub fn button(text: &str) -> Self {
        Self::new("button").with_text(text)
    }

    /// `<input type=button value=...>`.
    pub fn input_button(value: &str) -> Self {
        let mut element = Self::new("input").input_type("button");
        element.value = value.to_string();
        element
    }

    pub fn link(text: &str) -> Self {
        Self::new("a").with_text(text).attr("href", "#")
    }

    pub fn text(tag: &str, text: &str) -> Self {
        Self::new(tag).with_text(text)
    }

    pub fn input(id: &str) -> Self {
        Self::new("input").input_type("text").id(id)
    }

    pub fn select(id: &str, options: &[(&str, &str)]) -> Self {
        let mut element = Self::new("select").id(id);
        element.options = options
            .iter()
            .map(|(value, text)| SelectOption::new(*value, *text))
            .collect();
        element
    }

    pub fn radio(id: &str, name: &str) -> Self {
        Self::new("input").input_type("radio").id(id).name(name)
    }

    pub fn with_text(mut self, text: &str) -> Self {
        self.text = text.to_string();
        self
    }

    pub fn id(mut self, id: &str) -> Self {
        self.id = Some(id.to_string());
        self
    }

    pub fn name(mut self, name: &str) -> Self {
        self.name = Some(name.to_string());
        self
    }

    pub fn input_type(mut self, input_type: &str) -> Self {
        self.input_type = Some(input_type.to_string());
        self
    }

    pub fn class(mut self, class: &str) -> Self {
        self.classes.push(class.to_string());
        self
    }

    pub fn attr(mut self, key: &str, value: &str) -> Self {
        self.attrs.push((key.to_string(), value.to_string()));
        self
    }

    pub fn value(mut self, value: &str) -> Self {
        self.value = value.to_string();
        self
    }

    pub fn checked(mut self) -> Self {
        self.checked = true;
        self
    }

    pub fn hidden(mut self) -> Self {
        self.visible = false;
        self
    }

    pub fn disabled(mut self) -> Self {
        self.disabled = true;
        self
    }

    pub fn typing(mut self, typing: Typing) -> Self {
        self.typing = typing;
        self
    }

    pub fn script_check_sticks(mut self, sticks: bool) -> Self {
        self.script_check_sticks = sticks;
        self
    }

    pub fn goes_to(mut self, screen: usize) -> Self {
        self.on_click = Some(Transition::To(screen));
        self
    }

    pub fn goes_to_if_checked(mut self, radio: &str, then: usize, otherwise: usize) -> Self {
        self.on_click = Some(Transition::IfChecked {
            radio: radio.to_string(),
            then,
            otherwise,
        });
        self
    }

    pub fn on_focus_check(mut self, radio: &str) -> Self {
        self.on_focus_check = Some(radio.to_string());
        self
    }

    pub fn label(mut self, label: &str) -> Self {
        self.label = Some(label.to_string());
        self
    }

    /// Surround the element with raw markup, e.g. a calendar table.
    pub fn wrapped(mut self, open: &str, close: &str) -> Self {
        self.wrap = Some((open.to_string(), close.to_string()));
        self
    }

    fn is_input(&self) -> bool {
        self.tag == "input" || self.tag == "textarea"
    }

    fn is_radio(&self) -> bool {
        self.tag == "input" && self.input_type.as_deref() == Some("radio")
    }

    fn is_text_like(&self) -> bool {
        self.tag == "textarea"
            || (self.tag == "input"
                && matches!(
                    self.input_type.as_deref(),
                    None | Some("text") | Some("number") | Some("tel") | Some("email") | Some("search")
                ))
    }

    fn role(&self) -> Option<&'static str> {
        match (self.tag.as_str(), self.input_type.as_deref()) {
            ("button", _) => Some("button"),
            ("input", Some("button")) | ("input", Some("submit")) => Some("button"),
            ("a", _) => Some("link"),
            ("input", Some("radio")) => Some("radio"),
            ("input", Some("checkbox")) => Some("checkbox"),
            ("select", _) => Some("combobox"),
            _ if self.is_text_like() => Some("textbox"),
            _ => None,
        }
    }

    fn accessible_name(&self) -> String {
        match self.role() {
            Some("button") if self.tag == "input" => self.value.clone(),
            Some("button") | Some("link") => self.text.clone(),
            _ => self.label.clone().unwrap_or_default(),
        }
    }

    /// Text a reader sees for this element.
    fn visible_text(&self) -> String {
        let mut parts = Vec::new();
        if !self.text.is_empty() {
            parts.push(self.text.clone());
        }
        if self.tag == "select" {
            parts.extend(self.options.iter().map(|o| o.text.clone()));
        }
        if self.tag == "input" && self.role() == Some("button") {
            parts.push(self.value.clone());
        }
        if let Some(label) = &self.label {
            parts.push(label.clone());
        }
        parts.join(" ")
    }

    fn render(&self, index: usize) -> String {
        let mut attrs = format!(r#" data-eid="{}""#, index);
        if let Some(id) = &self.id {
            attrs.push_str(&format!(r#" id="{}""#, escape(id)));
        }
        if let Some(name) = &self.name {
            attrs.push_str(&format!(r#" name="{}""#, escape(name)));
        }
        if let Some(input_type) = &self.input_type {
            attrs.push_str(&format!(r#" type="{}""#, escape(input_type)));
        }
        if !self.classes.is_empty() {
            attrs.push_str(&format!(r#" class="{}""#, escape(&self.classes.join(" "))));
        }
        for (key, value) in &self.attrs {
            attrs.push_str(&format!(r#" {}="{}""#, key, escape(value)));
        }
        if self.checked {
            attrs.push_str(" checked");
        }
        if self.disabled {
            attrs.push_str(" disabled");
        }
        if !self.visible {
            attrs.push_str(r#" hidden style="display:none""#);
        }

        let body = match self.tag.as_str() {
            "input" => format!(r#"<input{} value="{}">"#, attrs, escape(&self.value)),
            "textarea" => format!("<textarea{}>{}</textarea>", attrs, escape(&self.value)),
            "select" => {
                let options: String = self
                    .options
                    .iter()
                    .map(|o| {
                        let selected = if !self.value.is_empty() && o.value == self.value {
                            " selected"
                        } else {
                            ""
                        };
                        format!(
                            r#"<option value="{}"{}>{}</option>"#,
                            escape(&o.value),
                            selected,
                            escape(&o.text)
                        )
                    })
                    .collect();
                format!("<select{}>{}</select>", attrs, options)
            }
            tag => format!("<{tag}{}>{}</{tag}>", attrs, escape(&self.text), tag = tag),
        };

        let label = match (&self.label, &self.id) {
            (Some(label), Some(id)) => format!(r#"<label for="{}">{}</label>"#, escape(id), escape(label)),
            (Some(label), None) => format!("<label>{}</label>", escape(label)),
            _ => String::new(),
        };

        match &self.wrap {
            Some((open, close)) => format!("{}{}{}{}", open, body, label, close),
            None => format!("{}{}", body, label),
        }
    }
}

fn escape(raw: &str) -> String {
    raw.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

/// One page of a scripted site.
#[derive(Debug, Clone)]
pub struct FakeScreen {
    pub elements: Vec<FakeElement>,
    /// Move on to another screen after some time, like a slow render.
    pub advance: Option<(Duration, usize)>,
}

impl FakeScreen {
    pub fn new(elements: Vec<FakeElement>) -> Self {
        Self {
            elements,
            advance: None,
        }
    }

    pub fn advance_after(mut self, after: Duration, screen: usize) -> Self {
        self.advance = Some((after, screen));
        self
    }
}

struct FakeState {
    screens: Vec<FakeScreen>,
    current: usize,
    entered: Instant,
    focused: Option<usize>,
    select_all: bool,
    clicks: Vec<String>,
    log: Vec<String>,
    navigations: Vec<String>,
    scripts: Vec<String>,
    responses: Vec<(String, Value)>,
    content_failures: usize,
    mouse_stall: Duration,
    closed: bool,
}

impl FakeState {
    fn sync(&mut self) {
        while let Some((after, next)) = self.screens[self.current].advance {
            if next == self.current || self.entered.elapsed() < after {
                break;
            }
            self.switch(next);
        }
    }

    fn switch(&mut self, screen: usize) {
        if screen < self.screens.len() {
            self.current = screen;
            self.entered = Instant::now();
            self.focused = None;
            self.select_all = false;
            self.log.push(format!("screen:{}", screen));
        }
    }

    fn elements(&self) -> &[FakeElement] {
        &self.screens[self.current].elements
    }

    fn element_mut(&mut self, index: usize) -> &mut FakeElement {
        let current = self.current;
        &mut self.screens[current].elements[index]
    }

    fn resolve(&mut self, element: &ElementRef) -> Result<usize> {
        self.sync();
        let stale = || AutobookError::StaleElement(element.to_string());
        let (screen, index) = element.0.split_once(':').ok_or_else(stale)?;
        let screen: usize = screen.parse().map_err(|_| stale())?;
        let index: usize = index.parse().map_err(|_| stale())?;
        if screen != self.current || index >= self.elements().len() {
            return Err(stale());
        }
        Ok(index)
    }

    fn reference(&self, index: usize) -> ElementRef {
        ElementRef(format!("{}:{}", self.current, index))
    }

    fn html(&self) -> String {
        let body: String = self
            .elements()
            .iter()
            .enumerate()
            .map(|(i, e)| e.render(i))
            .collect::<Vec<_>>()
            .join("\n");
        format!("<html><head><title>cita previa</title></head><body>\n{}\n</body></html>", body)
    }

    fn body_text(&self) -> String {
        self.elements()
            .iter()
            .filter(|e| e.visible)
            .map(FakeElement::visible_text)
            .filter(|t| !t.is_empty())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn rect(&self, index: usize) -> Option<ElementRect> {
        self.elements().get(index).filter(|e| e.visible).map(|_| ElementRect {
            x: 20.0,
            y: 10.0 + 40.0 * index as f64,
            width: 300.0,
            height: 30.0,
        })
    }

    fn describe(&self, index: usize) -> String {
        let element = &self.elements()[index];
        element
            .id
            .clone()
            .or_else(|| (!element.text.is_empty()).then(|| element.text.clone()))
            .unwrap_or_else(|| format!("{}#{}", element.tag, index))
    }

    fn check_radio(&mut self, index: usize) {
        let name = self.elements()[index].name.clone();
        let current = self.current;
        for (i, other) in self.screens[current].elements.iter_mut().enumerate() {
            if i != index && other.is_radio() && name.is_some() && other.name == name {
                other.checked = false;
            }
        }
        self.element_mut(index).checked = true;
    }

    fn check_radio_by_id(&mut self, id: &str) {
        if let Some(index) = self.elements().iter().position(|e| e.id.as_deref() == Some(id)) {
            self.check_radio(index);
        }
    }

    fn focus(&mut self, index: usize) {
        if self.focused != Some(index) {
            self.select_all = false;
        }
        self.focused = Some(index);
        if let Some(radio) = self.elements()[index].on_focus_check.clone() {
            self.check_radio_by_id(&radio);
        }
    }

    fn activate(&mut self, index: usize) {
        let description = self.describe(index);
        self.clicks.push(description.clone());
        self.log.push(format!("click:{}", description));
        self.focus(index);

        let element = &self.elements()[index];
        if element.is_radio() {
            self.check_radio(index);
        } else if element.tag == "input" && element.input_type.as_deref() == Some("checkbox") {
            let checked = element.checked;
            self.element_mut(index).checked = !checked;
        }

        let target = match self.elements()[index].on_click.clone() {
            Some(Transition::To(screen)) => Some(screen),
            Some(Transition::IfChecked {
                radio,
                then,
                otherwise,
            }) => {
                let checked = self
                    .elements()
                    .iter()
                    .any(|e| e.id.as_deref() == Some(radio.as_str()) && e.checked);
                Some(if checked { then } else { otherwise })
            }
            None => None,
        };
        if let Some(screen) = target {
            self.switch(screen);
        }
    }

    fn enter_text(&mut self, text: &str, keystroke: bool) {
        let Some(index) = self.focused else {
            self.log.push(format!("typed-into-nothing:{}", text));
            return;
        };
        if !self.elements()[index].is_input() {
            return;
        }
        let typing = self.elements()[index].typing;
        let accepted = match (typing, keystroke) {
            (Typing::RejectsAll, _) | (Typing::RejectsKeystrokes, true) => return,
            (Typing::Uppercases, _) => text.to_uppercase(),
            _ => text.to_string(),
        };
        let clear = std::mem::take(&mut self.select_all);
        let element = self.element_mut(index);
        if clear {
            element.value.clear();
        }
        element.value.push_str(&accepted);
    }
}

/// In-memory page that behaves like the portal as far as the engine can tell.
pub struct FakePage {
    state: Mutex<FakeState>,
}

impl FakePage {
    pub fn new(elements: Vec<FakeElement>) -> Self {
        Self::with_screens(vec![FakeScreen::new(elements)])
    }

    pub fn with_screens(screens: Vec<FakeScreen>) -> Self {
        let screens = if screens.is_empty() {
            vec![FakeScreen::new(Vec::new())]
        } else {
            screens
        };
        Self {
            state: Mutex::new(FakeState {
                screens,
                current: 0,
                entered: Instant::now(),
                focused: None,
                select_all: false,
                clicks: Vec::new(),
                log: Vec::new(),
                navigations: Vec::new(),
                scripts: Vec::new(),
                responses: Vec::new(),
                content_failures: 0,
                mouse_stall: Duration::ZERO,
                closed: false,
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
        state.sync();
        state
    }

    /// Answer scripts containing `fragment` with `value`.
    pub fn respond_to(&self, fragment: &str, value: Value) {
        self.state().responses.push((fragment.to_string(), value));
    }

    /// Make the next `count` `content()` calls fail.
    pub fn fail_content(&self, count: usize) {
        self.state().content_failures = count;
    }

    /// Make every mouse move hang for `stall`, like a browser that stops
    /// answering input events.
    pub fn stall_mouse(&self, stall: Duration) {
        self.state().mouse_stall = stall;
    }

    pub fn set_screen(&self, screen: usize) {
        self.state().switch(screen);
    }

    pub fn current_screen(&self) -> usize {
        self.state().current
    }

    pub fn clicks(&self) -> Vec<String> {
        self.state().clicks.clone()
    }

    pub fn log(&self) -> Vec<String> {
        self.state().log.clone()
    }

    pub fn navigations(&self) -> Vec<String> {
        self.state().navigations.clone()
    }

    pub fn scripts(&self) -> Vec<String> {
        self.state().scripts.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.state().closed
    }

    /// Value of the element with `id` on any screen, current screen first.
    pub fn value_of(&self, id: &str) -> Option<String> {
        self.find_by_id(id).map(|e| e.value)
    }

    pub fn is_checked_id(&self, id: &str) -> bool {
        self.find_by_id(id).map(|e| e.checked).unwrap_or(false)
    }

    fn find_by_id(&self, id: &str) -> Option<FakeElement> {
        let state = self.state();
        let current = state.elements().iter();
        let others = state
            .screens
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != state.current)
            .flat_map(|(_, s)| s.elements.iter());
        current
            .chain(others)
            .find(|e| e.id.as_deref() == Some(id))
            .cloned()
    }

    fn locate_indices(state: &FakeState, locator: &Locator) -> Result<Vec<usize>> {
        let elements = state.elements();
        let visible = |e: &FakeElement| e.visible;
        match locator {
            Locator::Css { selector } => css_matches(&state.html(), selector),
            Locator::Role { role, name } => {
                let pattern = regex(name)?;
                Ok(elements
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| visible(e) && e.role() == Some(role.as_str()))
                    .filter(|(_, e)| pattern.is_match(&e.accessible_name()))
                    .map(|(i, _)| i)
                    .collect())
            }
            Locator::Text { pattern } => {
                let pattern = regex(pattern)?;
                Ok(elements
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| visible(e) && e.tag != "select" && !e.text.is_empty())
                    .filter(|(_, e)| pattern.is_match(&e.text))
                    .map(|(i, _)| i)
                    .collect())
            }
            Locator::Label { pattern } => {
                let pattern = regex(pattern)?;
                Ok(elements
                    .iter()
                    .enumerate()
                    .filter(|(_, e)| visible(e))
                    .filter(|(_, e)| e.label.as_deref().map(|l| pattern.is_match(l)).unwrap_or(false))
                    .map(|(i, _)| i)
                    .collect())
            }
            Locator::NearText { phrases } => {
                let Some(anchor) = anchor_index(elements, phrases) else {
                    return Ok(Vec::new());
                };
                Ok(elements
                    .iter()
                    .enumerate()
                    .skip(anchor + 1)
                    .find(|(_, e)| e.visible && !e.disabled && e.is_text_like())
                    .map(|(i, _)| vec![i])
                    .unwrap_or_default())
            }
            Locator::AfterText { phrases, selector } => {
                let Some(anchor) = anchor_index(elements, phrases) else {
                    return Ok(Vec::new());
                };
                let matches = css_matches(&state.html(), selector)?;
                Ok(matches.into_iter().find(|i| *i > anchor).into_iter().collect())
            }
        }
    }

    fn with_element<T>(&self, element: &ElementRef, f: impl FnOnce(&mut FakeState, usize) -> Result<T>) -> Result<T> {
        let mut state = self.state();
        let index = state.resolve(element)?;
        f(&mut state, index)
    }
}

fn regex(pattern: &str) -> Result<Regex> {
    RegexBuilder::new(pattern)
        .case_insensitive(true)
        .build()
        .map_err(|e| AutobookError::InvalidLocator(format!("/{}/: {}", pattern, e)))
}

fn css_matches(html: &str, selector: &str) -> Result<Vec<usize>> {
    let parsed = Selector::parse(selector)
        .map_err(|e| AutobookError::InvalidLocator(format!("{}: {:?}", selector, e)))?;
    let document = Html::parse_document(html);
    let indices = document
        .select(&parsed)
        .filter_map(|node| node.value().attr("data-eid")?.parse().ok())
        .collect();
    Ok(indices)
}

fn anchor_index(elements: &[FakeElement], phrases: &[String]) -> Option<usize> {
    elements
        .iter()
        .position(|e| e.visible && !e.is_input() && contains_any(&fold(&e.visible_text()), phrases))
}

#[async_trait]
impl PageDriver for FakePage {
    async fn navigate(&self, url: &str) -> Result<()> {
        let mut state = self.state();
        state.navigations.push(url.to_string());
        state.switch(0);
        Ok(())
    }

    async fn content(&self) -> Result<String> {
        let mut state = self.state();
        if state.content_failures > 0 {
            state.content_failures -= 1;
            return Err(AutobookError::SnapshotFailed("page is navigating".to_string()));
        }
        Ok(state.html())
    }

    async fn body_text(&self) -> Result<String> {
        Ok(self.state().body_text())
    }

    async fn locate(&self, locator: &Locator) -> Result<Vec<ElementRef>> {
        let state = self.state();
        let indices = Self::locate_indices(&state, locator)?;
        Ok(indices.into_iter().map(|i| state.reference(i)).collect())
    }

    async fn bounding_box(&self, element: &ElementRef) -> Result<Option<ElementRect>> {
        self.with_element(element, |state, index| Ok(state.rect(index)))
    }

    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()> {
        self.with_element(element, |_, _| Ok(()))
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        let stall = {
            let mut state = self.state();
            state.log.push(format!("move:{:.0},{:.0}", x, y));
            state.mouse_stall
        };
        if !stall.is_zero() {
            tokio::time::sleep(stall).await;
        }
        Ok(())
    }

    async fn mouse_click(&self, x: f64, y: f64) -> Result<()> {
        let mut state = self.state();
        let hit = (0..state.elements().len())
            .find(|i| state.rect(*i).map(|r| r.contains(x, y)).unwrap_or(false));
        match hit {
            Some(index) if !state.elements()[index].disabled => state.activate(index),
            Some(_) => state.log.push("click:disabled".to_string()),
            None => state.log.push(format!("click:miss@{:.0},{:.0}", x, y)),
        }
        Ok(())
    }

    async fn mouse_wheel(&self, delta_y: f64) -> Result<()> {
        self.state().log.push(format!("wheel:{:.0}", delta_y));
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        self.with_element(element, |state, index| {
            state.activate(index);
            Ok(())
        })
    }

    async fn focus(&self, element: &ElementRef) -> Result<()> {
        self.with_element(element, |state, index| {
            state.focus(index);
            Ok(())
        })
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let mut state = self.state();
        state.log.push(format!("key:{}", key));
        match key {
            "Control+A" | "Meta+A" => state.select_all = true,
            "Delete" | "Backspace" => {
                if let Some(index) = state.focused {
                    let clear = std::mem::take(&mut state.select_all);
                    let element = state.element_mut(index);
                    if clear {
                        element.value.clear();
                    } else {
                        element.value.pop();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }

    async fn type_char(&self, ch: char) -> Result<()> {
        self.state().enter_text(&ch.to_string(), true);
        Ok(())
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        self.state().enter_text(text, false);
        Ok(())
    }

    async fn input_value(&self, element: &ElementRef) -> Result<String> {
        self.with_element(element, |state, index| Ok(state.elements()[index].value.clone()))
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<()> {
        self.with_element(element, |state, index| {
            let element = state.element_mut(index);
            match element.typing {
                Typing::RejectsAll => {}
                Typing::Uppercases => element.value = value.to_uppercase(),
                _ => element.value = value.to_string(),
            }
            Ok(())
        })
    }

    async fn select_options(&self, element: &ElementRef) -> Result<Vec<SelectOption>> {
        self.with_element(element, |state, index| Ok(state.elements()[index].options.clone()))
    }

    async fn select_option(&self, element: &ElementRef, value: &str) -> Result<()> {
        self.with_element(element, |state, index| {
            let element = state.element_mut(index);
            if element.options.iter().any(|o| o.value == value) {
                element.value = value.to_string();
                state.log.push(format!("select:{}", value));
                Ok(())
            } else {
                Err(AutobookError::ElementNotFound(format!("option '{}'", value)))
            }
        })
    }

    async fn set_checked(&self, element: &ElementRef) -> Result<bool> {
        self.with_element(element, |state, index| {
            if state.elements()[index].script_check_sticks {
                state.check_radio(index);
            }
            Ok(state.elements()[index].checked)
        })
    }

    async fn is_checked(&self, element: &ElementRef) -> Result<bool> {
        self.with_element(element, |state, index| Ok(state.elements()[index].checked))
    }

    async fn evaluate(&self, script: &str, _await_promise: bool) -> Result<Value> {
        let mut state = self.state();
        state.scripts.push(script.to_string());
        let response = state
            .responses
            .iter()
            .find(|(fragment, _)| script.contains(fragment.as_str()))
            .map(|(_, value)| value.clone());
        Ok(response.unwrap_or(Value::Null))
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        Ok(b"\x89PNG\r\n\x1a\nfake".to_vec())
    }

    async fn close(&self) -> Result<()> {
        self.state().closed = true;
        Ok(())
    }
}

/// Alarm that "finishes playing" after a fixed number of polls.
pub struct FakeAlarm {
    polls_until_end: usize,
    starts: AtomicUsize,
    polls: AtomicUsize,
}

impl FakeAlarm {
    pub fn new(polls_until_end: usize) -> Self {
        Self {
            polls_until_end,
            starts: AtomicUsize::new(0),
            polls: AtomicUsize::new(0),
        }
    }

    /// Never ends; only cancellation gets past it.
    pub fn endless() -> Self {
        Self::new(usize::MAX)
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    pub fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Alarm for FakeAlarm {
    async fn start(&self, _page: &dyn PageDriver) -> AlertDiagnostics {
        self.starts.fetch_add(1, Ordering::SeqCst);
        AlertDiagnostics {
            ok: true,
            created: true,
            paused: false,
            current_time: 0.5,
            events: vec!["play".to_string(), "playing".to_string()],
            ..AlertDiagnostics::default()
        }
    }

    async fn has_ended(&self, _page: &dyn PageDriver) -> Result<bool> {
        let polls = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(polls >= self.polls_until_end)
    }
}

pub struct FakeSession {
    id: String,
    page: Arc<FakePage>,
    closed: Arc<AtomicUsize>,
}

impl FakeSession {
    pub fn fake_page(&self) -> Arc<FakePage> {
        self.page.clone()
    }
}

#[async_trait]
impl BrowserSession for FakeSession {
    fn id(&self) -> &str {
        &self.id
    }

    fn page(&self) -> Arc<dyn PageDriver> {
        self.page.clone()
    }

    async fn close(self: Box<Self>) -> Result<()> {
        self.page.close().await?;
        self.closed.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Hands out pre-built pages, one per cycle; fails to open once they run out.
pub struct FakeSessionFactory {
    pages: Mutex<VecDeque<Arc<FakePage>>>,
    opened: AtomicUsize,
    closed: Arc<AtomicUsize>,
}

impl FakeSessionFactory {
    pub fn new(pages: Vec<Arc<FakePage>>) -> Self {
        Self {
            pages: Mutex::new(pages.into()),
            opened: AtomicUsize::new(0),
            closed: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn opened(&self) -> usize {
        self.opened.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Sessions currently open.
    pub fn live(&self) -> usize {
        self.opened() - self.closed()
    }
}

#[async_trait]
impl SessionFactory for FakeSessionFactory {
    async fn open(&self) -> Result<Box<dyn BrowserSession>> {
        let page = self
            .pages
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .pop_front()
            .ok_or_else(|| AutobookError::LaunchFailed("no more fake pages".to_string()))?;
        let n = self.opened.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeSession {
            id: format!("fake-{}", n),
            page,
            closed: self.closed.clone(),
        }))
    }
}
