use crate::core::PageDriver;
use crate::errors::{AutobookError, Result};
use serde_json::Value;
use std::time::Duration;

/// `document.body.scrollHeight`, used to size scroll passes.
pub const SCROLL_HEIGHT: &str = "document.body ? document.body.scrollHeight : 0";

/// Blur whatever has focus so change handlers run before verification.
pub const BLUR_ACTIVE: &str =
    "document.activeElement && document.activeElement.blur && document.activeElement.blur()";

/// Let the name field accept spaces and detach the portal's upper-casing
/// keyup handlers on the identity inputs.
pub const PREPARE_IDENTITY_INPUTS: &str = r#"
(() => {
  const name = document.querySelector('#txtDesCitado');
  if (name) name.removeAttribute('pattern');
  const $ = window.jQuery;
  if ($) { $('#txtIdCitado,#txtDesCitado').off('keyup'); }
  return true;
})()
"#;

/// Injects (or reuses) the alarm `<audio>` element and tries to play it.
/// Without a source it beeps through WebAudio for `__TONE_MS__` and then
/// marks the element done. `__ALARM_ID__` and `__ALARM_SRC__` (a JSON
/// string) are substituted too.
pub const ALARM_START: &str = r#"
(async () => {
  const url = __ALARM_SRC__;
  const result = {
    ok: false, created: false, hadElem: false, readyState: -1, paused: true,
    currentTime: 0, error: null, events: [], srcPrefix: (url || '').slice(0, 32),
  };
  try {
    let a = document.getElementById('__ALARM_ID__');
    result.hadElem = !!a;
    if (!a) {
      a = document.createElement('audio');
      a.id = '__ALARM_ID__';
      a.autoplay = true;
      a.loop = false;
      a.preload = 'auto';
      a.playsInline = true;
      a.muted = false;
      a.volume = 1.0;
      ['loadstart','durationchange','loadedmetadata','loadeddata','canplay',
       'canplaythrough','play','playing','pause','timeupdate','stalled','error','ended']
        .forEach(ev => a.addEventListener(ev, e => result.events.push(e.type)));
      document.body.appendChild(a);
      result.created = true;
    }
    if (!url) {
      const AC = window.AudioContext || window.webkitAudioContext;
      if (!AC) { result.error = 'no audio source and no WebAudio'; a.dataset.toneDone = '1'; return result; }
      const ctx = new AC();
      try { await ctx.resume(); } catch (e) {}
      const gain = ctx.createGain();
      gain.gain.value = 0.4;
      gain.connect(ctx.destination);
      const seconds = __TONE_MS__ / 1000;
      for (let t = 0; t < seconds; t += 0.5) {
        const osc = ctx.createOscillator();
        osc.type = 'square';
        osc.frequency.value = 880;
        osc.connect(gain);
        osc.start(ctx.currentTime + t);
        osc.stop(ctx.currentTime + Math.min(t + 0.3, seconds));
      }
      a.dataset.toneDone = '0';
      setTimeout(() => { a.dataset.toneDone = '1'; ctx.close(); }, __TONE_MS__);
      result.events.push('webaudio');
      result.readyState = 0;
      result.paused = ctx.state !== 'running';
      result.ok = ctx.state === 'running';
      return result;
    }
    a.src = url;
    await new Promise(r => setTimeout(r, 50));
    await new Promise(resolve => {
      let done = false;
      const finish = () => { if (!done) { done = true; resolve(); } };
      setTimeout(finish, 2000);
      a.addEventListener('loadedmetadata', finish, { once: true });
      a.addEventListener('canplay', finish, { once: true });
    });
    try { await a.play(); } catch (e) { result.error = String((e && e.message) || e); }
    await new Promise(r => setTimeout(r, 500));
    result.readyState = a.readyState;
    result.paused = a.paused;
    result.currentTime = a.currentTime || 0;
    result.ok = result.currentTime > 0 || result.paused === false || result.events.includes('playing');
  } catch (e) {
    result.error = 'outer:' + ((e && e.message) || String(e));
  }
  return result;
})()
"#;

/// True once the alarm element exists and its clip or tone has finished.
pub const ALARM_ENDED: &str = r#"
(() => {
  const a = document.getElementById('__ALARM_ID__');
  return !!(a && (a.ended || a.dataset.toneDone === '1'));
})()
"#;

pub struct JavaScriptRunner;

impl JavaScriptRunner {
    pub async fn run(page: &dyn PageDriver, script: &str) -> Result<Value> {
        page.evaluate(script, false).await
    }

    /// Evaluate a promise-returning script, giving up after `limit`.
    pub async fn run_async_with_timeout(
        page: &dyn PageDriver,
        script: &str,
        limit: Duration,
    ) -> Result<Value> {
        tokio::time::timeout(limit, page.evaluate(script, true))
            .await
            .map_err(|_| {
                AutobookError::TimeoutError(format!("script still running after {:?}", limit))
            })?
    }

    /// Fill the alarm templates.
    pub fn alarm_script(
        template: &str,
        element_id: &str,
        source: Option<&str>,
        tone_ms: u64,
    ) -> Result<String> {
        let source = serde_json::to_string(&source.unwrap_or(""))?;
        Ok(template
            .replace("__ALARM_ID__", element_id)
            .replace("__ALARM_SRC__", &source)
            .replace("__TONE_MS__", &tone_ms.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alarm_script_substitution() {
        let script = JavaScriptRunner::alarm_script(
            ALARM_START,
            "__cita_alarm__",
            Some("data:audio/mpeg;base64,AAA"),
            8000,
        )
        .unwrap();
        assert!(script.contains("getElementById('__cita_alarm__')"));
        assert!(script.contains(r#"const url = "data:audio/mpeg;base64,AAA";"#));
        assert!(script.contains("const seconds = 8000 / 1000;"));
        assert!(!script.contains("__ALARM_"));
        assert!(!script.contains("__TONE_MS__"));

        let ended = JavaScriptRunner::alarm_script(ALARM_ENDED, "x", None, 0).unwrap();
        assert!(ended.contains("getElementById('x')"));
    }
}
