use crate::core::{ElementRef, Locator, PageDriver};
use crate::errors::{AutobookError, Result};
use crate::types::{ElementRect, SelectOption};
use async_trait::async_trait;
use headless_chrome::browser::tab::point::Point;
use headless_chrome::browser::tab::ModifierKey;
use headless_chrome::protocol::cdp::types::Event;
use headless_chrome::protocol::cdp::Page::CaptureScreenshotFormatOption;
use headless_chrome::protocol::cdp::Runtime::RemoteObject;
use headless_chrome::Tab;
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

/// Resolves a [`Locator`] in the page, tags every hit with a
/// `data-cita-ref` attribute and returns the tags in document order.
const LOCATE: &str = r#"
(() => {
  const loc = __LOCATOR__;
  const fold = s => (s || '').normalize('NFD').replace(/[\u0300-\u036f]/g, '').toLowerCase();
  const visible = el => {
    const r = el.getBoundingClientRect();
    const cs = window.getComputedStyle(el);
    return r.width > 0 && r.height > 0 && cs.visibility !== 'hidden' && cs.display !== 'none';
  };
  const textOf = el => (el.innerText || el.textContent || '').trim();
  const labelOf = el => {
    if (el.labels && el.labels.length) return Array.from(el.labels).map(textOf).join(' ');
    return el.getAttribute('aria-label') || '';
  };
  const roleOf = el => {
    const explicit = el.getAttribute('role');
    if (explicit) return explicit;
    const tag = el.tagName.toLowerCase();
    const type = (el.getAttribute('type') || 'text').toLowerCase();
    if (tag === 'button') return 'button';
    if (tag === 'a' && el.hasAttribute('href')) return 'link';
    if (tag === 'select') return 'combobox';
    if (tag === 'textarea') return 'textbox';
    if (tag === 'input') {
      if (['button', 'submit', 'reset', 'image'].includes(type)) return 'button';
      if (type === 'radio') return 'radio';
      if (type === 'checkbox') return 'checkbox';
      if (['text', 'search', 'email', 'tel', 'number', 'url'].includes(type)) return 'textbox';
    }
    return '';
  };
  const nameOf = el => {
    const role = roleOf(el);
    if (role === 'button' && el.tagName === 'INPUT') return el.value || '';
    if (role === 'button' || role === 'link') return textOf(el) || el.getAttribute('title') || '';
    return labelOf(el);
  };
  const all = Array.from(document.querySelectorAll('body *'));
  const innermost = list => list.filter(el => !list.some(o => o !== el && el.contains(o)));
  const anchorFor = phrases => {
    const wanted = phrases.map(fold);
    const hits = all.filter(el => visible(el) && wanted.some(p => fold(textOf(el)).includes(p)));
    return innermost(hits)[0] || null;
  };
  const after = (anchor, el) =>
    !anchor.contains(el) && (anchor.compareDocumentPosition(el) & Node.DOCUMENT_POSITION_FOLLOWING);
  const textLike = el => el.tagName === 'TEXTAREA' ||
    (el.tagName === 'INPUT' && ['text', 'search', 'email', 'tel', 'number', ''].includes((el.getAttribute('type') || '').toLowerCase()));

  let found = [];
  switch (loc.kind) {
    case 'css':
      found = Array.from(document.querySelectorAll(loc.selector));
      break;
    case 'role': {
      const re = new RegExp(loc.name, 'i');
      found = all.filter(el => roleOf(el) === loc.role && visible(el) && re.test(nameOf(el)));
      break;
    }
    case 'text': {
      const re = new RegExp(loc.pattern, 'i');
      found = innermost(all.filter(el => el.tagName !== 'SELECT' && visible(el) && re.test(textOf(el))));
      break;
    }
    case 'label': {
      const re = new RegExp(loc.pattern, 'i');
      found = all.filter(el => el.labels && el.labels.length && visible(el) && re.test(labelOf(el)));
      break;
    }
    case 'near_text': {
      const anchor = anchorFor(loc.phrases);
      if (anchor) {
        const input = all.find(el => textLike(el) && after(anchor, el) && visible(el) && !el.disabled);
        if (input) found = [input];
      }
      break;
    }
    case 'after_text': {
      const anchor = anchorFor(loc.phrases);
      if (anchor) {
        const hit = Array.from(document.querySelectorAll(loc.selector)).find(el => after(anchor, el));
        if (hit) found = [hit];
      }
      break;
    }
  }
  window.__citaRef = window.__citaRef || 0;
  return found.map(el => {
    if (!el.dataset.citaRef) el.dataset.citaRef = String(++window.__citaRef);
    return el.dataset.citaRef;
  });
})()
"#;

/// Serialized DOM with live form state copied into attributes, so
/// selectors such as `[checked]` see what the user sees.
const MIRRORED_CONTENT: &str = r#"
(() => {
  const clone = document.documentElement.cloneNode(true);
  const live = document.documentElement.querySelectorAll('input,select,textarea');
  const copies = clone.querySelectorAll('input,select,textarea');
  live.forEach((el, i) => {
    const c = copies[i];
    if (!c) return;
    if (el.type === 'checkbox' || el.type === 'radio') {
      if (el.checked) c.setAttribute('checked', ''); else c.removeAttribute('checked');
    } else if (el.tagName === 'SELECT') {
      Array.from(c.options).forEach((o, j) => {
        if (el.options[j] && el.options[j].selected) o.setAttribute('selected', '');
        else o.removeAttribute('selected');
      });
    } else if (el.tagName === 'TEXTAREA') {
      c.textContent = el.value;
    } else {
      c.setAttribute('value', el.value);
    }
  });
  return '<!DOCTYPE html>' + clone.outerHTML;
})()
"#;

/// [`PageDriver`] over a headless_chrome tab.
///
/// Tab calls block, so each one runs on tokio's blocking pool; a timeout
/// wrapped around any of these futures then fires on time even while
/// Chrome is still answering.
pub struct ChromeDriver {
    tab: Arc<Tab>,
}

impl ChromeDriver {
    pub fn new(tab: Arc<Tab>) -> Self {
        Self { tab }
    }

    pub fn tab(&self) -> &Arc<Tab> {
        &self.tab
    }

    async fn with_tab<T, F>(&self, work: F) -> Result<T>
    where
        F: FnOnce(&Tab) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let tab = self.tab.clone();
        tokio::task::spawn_blocking(move || work(tab.as_ref()))
            .await
            .map_err(chrome_error)?
    }

    /// Evaluate `expression` and bring its result back through JSON, since
    /// the protocol only returns primitives by value.
    async fn eval_json(&self, expression: &str, await_promise: bool) -> Result<Value> {
        let wrapped = if await_promise {
            format!(
                "Promise.resolve(({})).then(v => JSON.stringify(v === undefined ? null : v))",
                expression
            )
        } else {
            format!(
                "(() => {{ const v = ({}); return JSON.stringify(v === undefined ? null : v); }})()",
                expression
            )
        };
        let result = self
            .with_tab(move |tab| {
                tab.evaluate(&wrapped, await_promise)
                    .map_err(|e| AutobookError::JavaScriptFailed(e.to_string()))
            })
            .await?;
        match result.value {
            Some(Value::String(json)) => Ok(serde_json::from_str(&json)?),
            Some(other) => Ok(other),
            None => Ok(Value::Null),
        }
    }

    /// Run `body` with `el` bound to the referenced element.
    async fn on_element(&self, element: &ElementRef, body: &str) -> Result<Value> {
        let reference = serde_json::to_string(&element.0)?;
        let script = format!(
            r#"(() => {{
                const el = document.querySelector('[data-cita-ref=' + JSON.stringify({}) + ']');
                if (!el) return {{ stale: true }};
                return {{ stale: false, value: ((el) => {{ {} }})(el) }};
            }})()"#,
            reference, body
        );
        let result = self.eval_json(&script, false).await?;
        if result.get("stale").and_then(Value::as_bool).unwrap_or(true) {
            return Err(AutobookError::StaleElement(element.to_string()));
        }
        Ok(result.get("value").cloned().unwrap_or(Value::Null))
    }

    async fn on_element_as<T: DeserializeOwned>(&self, element: &ElementRef, body: &str) -> Result<T> {
        Ok(serde_json::from_value(self.on_element(element, body).await?)?)
    }
}

fn chrome_error(e: impl std::fmt::Display) -> AutobookError {
    AutobookError::from_any_error(e)
}

/// Console arguments joined the way devtools prints them.
fn console_text(args: &[RemoteObject]) -> String {
    args.iter()
        .map(|arg| match (&arg.value, &arg.description) {
            (Some(Value::String(text)), _) => text.clone(),
            (Some(value), _) => value.to_string(),
            (None, Some(description)) => description.clone(),
            (None, None) => String::new(),
        })
        .collect::<Vec<_>>()
        .join(" ")
}

/// Copy the page's console output, uncaught exceptions and browser log
/// entries into the debug log.
pub fn attach_console_logging(tab: &Tab) -> Result<()> {
    tab.enable_log().map_err(chrome_error)?;
    tab.enable_runtime().map_err(chrome_error)?;
    tab.add_event_listener(Arc::new(|event: &Event| match event {
        Event::RuntimeConsoleAPICalled(call) => {
            debug!(target: "page", kind = ?call.params.Type, "{}", console_text(&call.params.args));
        }
        Event::RuntimeExceptionThrown(thrown) => {
            let details = &thrown.params.exception_details;
            let message = details
                .exception
                .as_ref()
                .and_then(|e| e.description.clone())
                .unwrap_or_else(|| details.text.clone());
            debug!(target: "page", line = details.line_number, url = ?details.url, "page error: {}", message);
        }
        Event::LogEntryAdded(added) => {
            let entry = &added.params.entry;
            debug!(target: "page", level = ?entry.level, url = ?entry.url, "{}", entry.text);
        }
        _ => {}
    }))
    .map_err(chrome_error)?;
    Ok(())
}

#[async_trait]
impl PageDriver for ChromeDriver {
    async fn navigate(&self, url: &str) -> Result<()> {
        let url = url.to_string();
        self.with_tab(move |tab| {
            tab.navigate_to(&url)
                .map_err(|e| AutobookError::NavigationFailed(e.to_string()))?;
            tab.wait_until_navigated()
                .map_err(|e| AutobookError::NavigationFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn content(&self) -> Result<String> {
        match self.eval_json(MIRRORED_CONTENT, false).await {
            Ok(Value::String(html)) => Ok(html),
            Ok(other) => Err(AutobookError::SnapshotFailed(format!("unexpected content: {}", other))),
            Err(e) => Err(AutobookError::SnapshotFailed(e.to_string())),
        }
    }

    async fn body_text(&self) -> Result<String> {
        let value = self
            .eval_json("document.body ? document.body.innerText : ''", false)
            .await
            .map_err(|e| AutobookError::SnapshotFailed(e.to_string()))?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn locate(&self, locator: &Locator) -> Result<Vec<ElementRef>> {
        let script = LOCATE.replace("__LOCATOR__", &serde_json::to_string(locator)?);
        let value = self
            .eval_json(&script, false)
            .await
            .map_err(|e| AutobookError::InvalidLocator(format!("{}: {}", locator, e)))?;
        let refs: Vec<String> = serde_json::from_value(value)?;
        Ok(refs.into_iter().map(ElementRef).collect())
    }

    async fn bounding_box(&self, element: &ElementRef) -> Result<Option<ElementRect>> {
        self.on_element_as(
            element,
            r#"const r = el.getBoundingClientRect();
               const cs = window.getComputedStyle(el);
               if (r.width === 0 || r.height === 0 || cs.visibility === 'hidden' || cs.display === 'none') return null;
               return { x: r.x, y: r.y, width: r.width, height: r.height };"#,
        )
        .await
    }

    async fn scroll_into_view(&self, element: &ElementRef) -> Result<()> {
        self.on_element(
            element,
            "el.scrollIntoView({ block: 'center', inline: 'center' }); return true;",
        )
        .await?;
        Ok(())
    }

    async fn mouse_move(&self, x: f64, y: f64) -> Result<()> {
        self.with_tab(move |tab| {
            tab.move_mouse_to_point(Point { x, y }).map_err(chrome_error)?;
            Ok(())
        })
        .await
    }

    async fn mouse_click(&self, x: f64, y: f64) -> Result<()> {
        self.with_tab(move |tab| {
            tab.click_point(Point { x, y }).map_err(chrome_error)?;
            Ok(())
        })
        .await
    }

    async fn mouse_wheel(&self, delta_y: f64) -> Result<()> {
        self.eval_json(&format!("window.scrollBy({{ top: {}, behavior: 'smooth' }})", delta_y), false)
            .await?;
        Ok(())
    }

    async fn click(&self, element: &ElementRef) -> Result<()> {
        self.on_element(element, "el.click(); return true;").await?;
        Ok(())
    }

    async fn focus(&self, element: &ElementRef) -> Result<()> {
        self.on_element(element, "el.focus(); return true;").await?;
        Ok(())
    }

    async fn press_key(&self, key: &str) -> Result<()> {
        let (modifier, key) = match key.split_once('+') {
            Some(("Control", key)) => (Some(ModifierKey::Ctrl), key),
            Some(("Meta", key)) => (Some(ModifierKey::Meta), key),
            Some(("Shift", key)) => (Some(ModifierKey::Shift), key),
            Some(("Alt", key)) => (Some(ModifierKey::Alt), key),
            _ => (None, key),
        };
        let key = key.to_string();
        self.with_tab(move |tab| {
            match modifier {
                Some(modifier) => tab
                    .press_key_with_modifiers(&key.to_ascii_lowercase(), Some(&[modifier]))
                    .map_err(|e| AutobookError::InputFailed(e.to_string()))?,
                None => tab
                    .press_key(&key)
                    .map_err(|e| AutobookError::InputFailed(e.to_string()))?,
            };
            Ok(())
        })
        .await
    }

    async fn type_char(&self, ch: char) -> Result<()> {
        self.with_tab(move |tab| {
            tab.send_character(&ch.to_string())
                .map_err(|e| AutobookError::InputFailed(e.to_string()))?;
            Ok(())
        })
        .await
    }

    async fn insert_text(&self, text: &str) -> Result<()> {
        let script = format!(
            "document.execCommand('insertText', false, {})",
            serde_json::to_string(text)?
        );
        self.eval_json(&script, false)
            .await
            .map_err(|e| AutobookError::InputFailed(e.to_string()))?;
        Ok(())
    }

    async fn input_value(&self, element: &ElementRef) -> Result<String> {
        let value = self
            .on_element(element, "return el.value == null ? '' : String(el.value);")
            .await?;
        Ok(value.as_str().unwrap_or_default().to_string())
    }

    async fn set_value(&self, element: &ElementRef, value: &str) -> Result<()> {
        let body = format!(
            r#"el.value = {};
               el.dispatchEvent(new Event('input', {{ bubbles: true }}));
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));
               return true;"#,
            serde_json::to_string(value)?
        );
        self.on_element(element, &body).await?;
        Ok(())
    }

    async fn select_options(&self, element: &ElementRef) -> Result<Vec<SelectOption>> {
        self.on_element_as(
            element,
            "return Array.from(el.options || []).map(o => ({ value: o.value, text: (o.text || '').trim() }));",
        )
        .await
    }

    async fn select_option(&self, element: &ElementRef, value: &str) -> Result<()> {
        let body = format!(
            r#"const v = {};
               if (!Array.from(el.options || []).some(o => o.value === v)) return false;
               el.value = v;
               el.dispatchEvent(new Event('input', {{ bubbles: true }}));
               el.dispatchEvent(new Event('change', {{ bubbles: true }}));
               return true;"#,
            serde_json::to_string(value)?
        );
        match self.on_element(element, &body).await? {
            Value::Bool(true) => Ok(()),
            _ => Err(AutobookError::ElementNotFound(format!("option '{}'", value))),
        }
    }

    async fn set_checked(&self, element: &ElementRef) -> Result<bool> {
        let value = self
            .on_element(
                element,
                r#"el.checked = true;
               el.dispatchEvent(new Event('input', { bubbles: true }));
               el.dispatchEvent(new Event('change', { bubbles: true }));
               return !!el.checked;"#,
            )
            .await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn is_checked(&self, element: &ElementRef) -> Result<bool> {
        let value = self.on_element(element, "return !!el.checked;").await?;
        Ok(value.as_bool().unwrap_or(false))
    }

    async fn evaluate(&self, script: &str, await_promise: bool) -> Result<Value> {
        self.eval_json(script, await_promise).await
    }

    async fn screenshot(&self) -> Result<Vec<u8>> {
        self.with_tab(|tab| {
            tab.capture_screenshot(CaptureScreenshotFormatOption::Png, None, None, true)
                .map_err(|e| AutobookError::ScreenshotFailed(e.to_string()))
        })
        .await
    }

    async fn close(&self) -> Result<()> {
        self.with_tab(|tab| {
            tab.close(true).map_err(chrome_error)?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn remote(raw: Value) -> RemoteObject {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn test_console_text_joins_arguments() {
        let args = vec![
            remote(json!({"type": "string", "value": "slot check"})),
            remote(json!({"type": "number", "value": 3})),
            remote(json!({"type": "object", "className": "HTMLElement", "description": "div#main"})),
        ];
        assert_eq!(console_text(&args), "slot check 3 div#main");
        assert_eq!(console_text(&[]), "");
    }
}
