use crate::actions::humanize::Pacer;
use crate::actions::intent::{ActionIntent, ActionOutcome, OptionChoice};
use crate::core::{ElementRef, Locator, PageDriver};
use crate::errors::{AutobookError, Result};
use crate::types::SelectOption;
use crate::utils::javascript::{JavaScriptRunner, SCROLL_HEIGHT};
use serde_json::json;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info, warn};

const CLEAR_KEY_PAUSE: Duration = Duration::from_millis(120);
const MAX_LOGGED_OPTIONS: usize = 50;

/// Turns [`ActionIntent`]s into concrete page interactions.
///
/// Each intent has an ordered list of strategies; the first that succeeds
/// wins. `perform` never returns an error and is bounded in time.
pub struct ActionResolver {
    page: Arc<dyn PageDriver>,
    pacer: Arc<Pacer>,
    mouse: Mutex<(f64, f64)>,
}

impl ActionResolver {
    pub fn new(page: Arc<dyn PageDriver>, pacer: Arc<Pacer>) -> Self {
        Self {
            page,
            pacer,
            mouse: Mutex::new((0.0, 0.0)),
        }
    }

    pub fn page(&self) -> &dyn PageDriver {
        self.page.as_ref()
    }

    pub fn pacer(&self) -> &Pacer {
        &self.pacer
    }

    pub async fn perform(&self, intent: &ActionIntent) -> ActionOutcome {
        let start = Instant::now();
        let bound = self.bound_for(intent);

        let outcome = match tokio::time::timeout(bound, self.dispatch(intent)).await {
            Ok(outcome) => outcome,
            Err(_) => ActionOutcome::failure(format!(
                "{} gave up after {} ms",
                intent.kind(),
                bound.as_millis()
            )),
        };
        let outcome = outcome.with_execution_time(start.elapsed().as_millis() as u64);

        if outcome.success {
            debug!(
                intent = intent.kind(),
                strategy = outcome.strategy.as_deref().unwrap_or("-"),
                elapsed_ms = outcome.execution_time_ms,
                "intent performed"
            );
        } else {
            debug!(
                intent = intent.kind(),
                diagnostic = outcome.diagnostic.as_deref().unwrap_or("-"),
                "intent failed"
            );
        }
        outcome
    }

    /// Upper bound on the whole strategy chain of an intent.
    fn bound_for(&self, intent: &ActionIntent) -> Duration {
        let pacing = self.pacer.pacing();
        let locate = pacing.locate_timeout();
        let action = pacing.action_timeout();
        match intent {
            ActionIntent::ClickText { .. } => action * 3,
            ActionIntent::Click { .. } => locate + action * 2,
            ActionIntent::SelectOption { .. } => locate + action * 2,
            ActionIntent::CheckRadio { .. } => locate + action * 2,
            ActionIntent::SetValue { .. } => locate + action,
            ActionIntent::TypeText { text, .. } => {
                locate + action + self.typing_bound(text.chars().count()) * 3
            }
        }
    }

    /// Bound for one typing strategy over `chars` keystrokes.
    fn typing_bound(&self, chars: usize) -> Duration {
        let pacing = self.pacer.pacing();
        let per_key = pacing.slow_keystroke.max()
            + Duration::from_millis(pacing.slow_keystroke_gap_ms)
            + Duration::from_millis(50);
        pacing.action_timeout() + per_key * chars as u32
    }

    async fn dispatch(&self, intent: &ActionIntent) -> ActionOutcome {
        match intent {
            ActionIntent::ClickText { pattern } => self.click_text(pattern).await,
            ActionIntent::Click { target } => self.click(target).await,
            ActionIntent::SelectOption { select, choice } => self.select_option(select, choice).await,
            ActionIntent::CheckRadio { target } => self.check_radio(target).await,
            ActionIntent::TypeText { field, text, label } => self.type_text(field, text, label).await,
            ActionIntent::SetValue { field, value, label } => self.set_value(field, value, label).await,
        }
    }

    async fn bounded<T>(&self, limit: Duration, what: &str, fut: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(limit, fut).await {
            Ok(result) => result,
            Err(_) => Err(AutobookError::TimeoutError(what.to_string())),
        }
    }

    async fn click_text(&self, pattern: &str) -> ActionOutcome {
        let strategies = [
            ("role:button", Locator::role("button", pattern)),
            ("role:link", Locator::role("link", pattern)),
            ("text", Locator::text(pattern)),
        ];
        let mut tried = Vec::new();

        for (name, locator) in strategies.iter() {
            let element = match self.page.locate(locator).await {
                Ok(found) => match found.into_iter().next() {
                    Some(element) => element,
                    None => continue,
                },
                Err(e) => {
                    tried.push(format!("{}: {}", name, e));
                    continue;
                }
            };
            let action = self.pacer.pacing().action_timeout();
            match self.bounded(action, name, self.human_click(&element)).await {
                Ok(()) => return ActionOutcome::success(*name),
                Err(e) => tried.push(format!("{}: {}", name, e)),
            }
        }

        if tried.is_empty() {
            ActionOutcome::failure(format!("nothing labelled /{}/i", pattern))
        } else {
            ActionOutcome::failure(format!("/{}/i: {}", pattern, tried.join("; ")))
        }
    }

    async fn click(&self, target: &[Locator]) -> ActionOutcome {
        let Some(element) = self.find_first(target, self.pacer.pacing().locate_timeout()).await else {
            return ActionOutcome::failure(not_found(target));
        };
        let action = self.pacer.pacing().action_timeout();
        let human = match self.bounded(action, "human click", self.human_click(&element)).await {
            Ok(()) => return ActionOutcome::success("human"),
            Err(e) => e,
        };
        match self.bounded(action, "forced click", self.page.click(&element)).await {
            Ok(()) => ActionOutcome::success("forced"),
            Err(e) => ActionOutcome::failure(format!("human: {}; forced: {}", human, e)),
        }
    }

    async fn select_option(&self, select: &[Locator], choice: &OptionChoice) -> ActionOutcome {
        if self.find_first(select, self.pacer.pacing().locate_timeout()).await.is_none() {
            return ActionOutcome::failure(not_found(select));
        }

        let mut seen = Vec::new();
        for element in self.locate_all(select).await {
            let options = self.read_options(&element).await;
            if let Some(option) = options.iter().find(|o| choice.matches(o)) {
                return self.choose(&element, option).await;
            }
            seen.extend(options.into_iter().map(|o| o.text).filter(|t| !t.is_empty()));
        }

        let sample: Vec<_> = seen.into_iter().take(MAX_LOGGED_OPTIONS).collect();
        ActionOutcome::failure(format!("no option {}; seen {:?}", choice, sample))
    }

    /// Human click on the select, then pick `option` by value.
    pub async fn choose(&self, select: &ElementRef, option: &SelectOption) -> ActionOutcome {
        let action = self.pacer.pacing().action_timeout();
        if let Err(e) = self.bounded(action, "open select", self.human_click(select)).await {
            debug!(error = %e, "could not click select, choosing anyway");
        }
        match self
            .bounded(action, "select option", self.page.select_option(select, &option.value))
            .await
        {
            Ok(()) => {
                self.pacer.step().await;
                ActionOutcome::success_with_data(
                    "select",
                    json!({ "value": option.value, "text": option.text }),
                )
            }
            Err(e) => ActionOutcome::failure(format!("selecting '{}': {}", option.text, e)),
        }
    }

    async fn check_radio(&self, target: &[Locator]) -> ActionOutcome {
        let Some(element) = self.find_first(target, self.pacer.pacing().locate_timeout()).await else {
            return ActionOutcome::failure(not_found(target));
        };
        let action = self.pacer.pacing().action_timeout();

        let script = match self.bounded(action, "script check", self.page.set_checked(&element)).await {
            Ok(true) => return ActionOutcome::success("script"),
            Ok(false) => "checked stayed false".to_string(),
            Err(e) => e.to_string(),
        };

        let forced = async {
            self.page.click(&element).await?;
            self.page.is_checked(&element).await
        };
        match self.bounded(action, "forced click", forced).await {
            Ok(true) => ActionOutcome::success("forced-click"),
            Ok(false) => ActionOutcome::failure(format!("script: {}; forced click left it unchecked", script)),
            Err(e) => ActionOutcome::failure(format!("script: {}; forced click: {}", script, e)),
        }
    }

    async fn type_text(&self, field: &[Locator], text: &str, label: &str) -> ActionOutcome {
        let Some(element) = self.find_first(field, self.pacer.pacing().locate_timeout()).await else {
            warn!(field = label, "could not find field to type into");
            return ActionOutcome::failure(not_found(field));
        };

        let action = self.pacer.pacing().action_timeout();
        if let Err(e) = self.bounded(action, "focus", self.human_click(&element)).await {
            debug!(field = label, error = %e, "human focus failed, focusing directly");
            if let Err(e) = self.page.focus(&element).await {
                warn!(field = label, error = %e, "could not focus field");
                return ActionOutcome::failure(format!("could not focus {}: {}", label, e));
            }
        }

        let limit = self.typing_bound(text.chars().count());
        for strategy in ["typed", "typed-slowly", "insert-text"] {
            self.clear_focused().await;
            let attempt = async {
                match strategy {
                    "typed" => self.type_keys(text, false).await,
                    "typed-slowly" => self.type_keys(text, true).await,
                    _ => self.page.insert_text(text).await,
                }
            };
            if let Err(e) = self.bounded(limit, strategy, attempt).await {
                debug!(field = label, strategy, error = %e, "typing strategy errored");
            }
            if self.reads_back(&element, text).await {
                info!(field = label, strategy, "field set");
                return ActionOutcome::success(strategy);
            }
        }

        let now = self.page.input_value(&element).await.unwrap_or_default();
        warn!(field = label, now = %now, "could not set field");
        ActionOutcome::failure(format!("{}: could not set (now='{}')", label, now))
    }

    async fn set_value(&self, field: &[Locator], value: &str, label: &str) -> ActionOutcome {
        let Some(element) = self.find_first(field, self.pacer.pacing().locate_timeout()).await else {
            return ActionOutcome::failure(not_found(field));
        };
        let action = self.pacer.pacing().action_timeout();
        if let Err(e) = self.bounded(action, "set value", self.page.set_value(&element, value)).await {
            return ActionOutcome::failure(format!("{}: {}", label, e));
        }
        if self.reads_back(&element, value).await {
            info!(field = label, "field set by script");
            ActionOutcome::success("script")
        } else {
            let now = self.page.input_value(&element).await.unwrap_or_default();
            ActionOutcome::failure(format!("{}: script value did not stick (now='{}')", label, now))
        }
    }

    async fn type_keys(&self, text: &str, slow: bool) -> Result<()> {
        for ch in text.chars() {
            self.page.type_char(ch).await?;
            tokio::time::sleep(self.pacer.keystroke_delay(slow)).await;
        }
        Ok(())
    }

    async fn clear_focused(&self) {
        for key in ["Control+A", "Meta+A", "Delete"] {
            if let Err(e) = self.page.press_key(key).await {
                debug!(key, error = %e, "clear key failed");
            }
            tokio::time::sleep(CLEAR_KEY_PAUSE).await;
        }
    }

    async fn reads_back(&self, element: &ElementRef, expected: &str) -> bool {
        matches!(self.page.input_value(element).await, Ok(value) if value == expected)
    }

    /// Scroll the element in, move along a jittered path to a random point
    /// inside it, and press.
    pub async fn human_click(&self, element: &ElementRef) -> Result<()> {
        self.page.scroll_into_view(element).await?;
        let rect = self
            .page
            .bounding_box(element)
            .await?
            .ok_or_else(|| AutobookError::ElementNotFound(format!("{} is not rendered", element)))?;

        let target = self.pacer.click_point(&rect);
        let from = *self.mouse.lock().unwrap_or_else(|p| p.into_inner());
        let path = self.pacer.mouse_path(from, target);
        let mut landing = from;
        for (x, y) in path {
            self.page.mouse_move(x, y).await?;
            landing = (x, y);
        }
        *self.mouse.lock().unwrap_or_else(|p| p.into_inner()) = landing;

        self.pacer.micro().await;
        self.page.mouse_click(landing.0, landing.1).await?;
        self.pacer.step().await;
        Ok(())
    }

    /// A few wheel passes with micro pauses, like someone skimming.
    pub async fn human_scroll(&self) {
        let height = match JavaScriptRunner::run(self.page(), SCROLL_HEIGHT).await {
            Ok(value) => value.as_f64().unwrap_or(0.0),
            Err(e) => {
                debug!(error = %e, "could not read page height");
                return;
            }
        };
        for delta in self.pacer.scroll_passes(height) {
            if self.page.mouse_wheel(delta).await.is_err() {
                return;
            }
            self.pacer.micro().await;
        }
    }

    /// First element of the first locator that matches, polling until `wait`.
    pub async fn find_first(&self, locators: &[Locator], wait: Duration) -> Option<ElementRef> {
        let deadline = Instant::now() + wait;
        loop {
            for locator in locators {
                match self.page.locate(locator).await {
                    Ok(found) => {
                        if let Some(element) = found.into_iter().next() {
                            return Some(element);
                        }
                    }
                    Err(e) => debug!(%locator, error = %e, "locator failed"),
                }
            }
            if Instant::now() >= deadline {
                return None;
            }
            tokio::time::sleep(self.pacer.pacing().poll_interval()).await;
        }
    }

    /// Every element any of the locators matches, in locator order, without duplicates.
    pub async fn locate_all(&self, locators: &[Locator]) -> Vec<ElementRef> {
        let mut all: Vec<ElementRef> = Vec::new();
        for locator in locators {
            if let Ok(found) = self.page.locate(locator).await {
                for element in found {
                    if !all.contains(&element) {
                        all.push(element);
                    }
                }
            }
        }
        all
    }

    pub async fn exists(&self, locators: &[Locator]) -> bool {
        self.find_first(locators, Duration::ZERO).await.is_some()
    }

    pub async fn wait_for_any(&self, locators: &[Locator], wait: Duration) -> bool {
        self.find_first(locators, wait).await.is_some()
    }

    pub async fn read_options(&self, select: &ElementRef) -> Vec<SelectOption> {
        match self.page.select_options(select).await {
            Ok(options) => options
                .into_iter()
                .map(|o| SelectOption::new(o.value, o.text.trim()))
                .collect(),
            Err(e) => {
                debug!(error = %e, "could not read options");
                Vec::new()
            }
        }
    }

    pub async fn input_value(&self, locators: &[Locator]) -> Option<String> {
        let element = self.find_first(locators, Duration::ZERO).await?;
        self.page.input_value(&element).await.ok()
    }
}

fn not_found(locators: &[Locator]) -> String {
    let tried: Vec<String> = locators.iter().map(ToString::to_string).collect();
    format!("no element for [{}]", tried.join(", "))
}
