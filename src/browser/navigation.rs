use crate::core::PageDriver;
use crate::dom::PageSnapshot;
use crate::errors::{AutobookError, Result};
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

pub struct NavigationManager;

impl NavigationManager {
    /// Navigate with an upper bound on how long the portal may take.
    pub async fn goto(page: &dyn PageDriver, url: &str, timeout: Duration) -> Result<NavigationResult> {
        let start_time = Instant::now();
        match tokio::time::timeout(timeout, page.navigate(url)).await {
            Ok(Ok(())) => Ok(NavigationResult {
                url: url.to_string(),
                duration_ms: start_time.elapsed().as_millis() as u64,
            }),
            Ok(Err(e)) => Err(AutobookError::NavigationFailed(format!("{}: {}", url, e))),
            Err(_) => Err(AutobookError::TimeoutError(format!(
                "navigation to {} took longer than {:?}",
                url, timeout
            ))),
        }
    }

    /// Poll the page until `predicate` holds or the timeout passes. Returns
    /// whether it held and the last snapshot read.
    pub async fn wait_for_snapshot<F>(
        page: &dyn PageDriver,
        timeout: Duration,
        poll: Duration,
        predicate: F,
    ) -> (bool, PageSnapshot)
    where
        F: Fn(&PageSnapshot) -> bool + Send,
    {
        let start_time = Instant::now();
        let mut last = PageSnapshot::default();
        loop {
            match PageSnapshot::capture(page).await {
                Ok(snapshot) => {
                    if predicate(&snapshot) {
                        return (true, snapshot);
                    }
                    last = snapshot;
                }
                Err(e) => debug!(error = %e, "snapshot failed while waiting"),
            }
            if start_time.elapsed() >= timeout {
                return (false, last);
            }
            tokio::time::sleep(poll).await;
        }
    }

    /// Wait until the page text contains one of `phrases`; returns the
    /// phrase found.
    pub async fn wait_for_text(
        page: &dyn PageDriver,
        phrases: &[String],
        timeout: Duration,
        poll: Duration,
    ) -> Option<String> {
        let (found, snapshot) =
            Self::wait_for_snapshot(page, timeout, poll, |s| s.parse().text_phrase(phrases).is_some()).await;
        if !found {
            return None;
        }
        snapshot
            .parse()
            .text_phrase(phrases)
            .map(|p| p.trim_start_matches("text:").to_string())
    }
}

#[derive(Debug, Clone)]
pub struct NavigationResult {
    pub url: String,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeElement, FakePage, FakeScreen};

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_text_sees_late_confirmation() {
        let page = FakePage::with_screens(vec![
            FakeScreen::new(vec![]).advance_after(Duration::from_secs(5), 1),
            FakeScreen::new(vec![FakeElement::text("h2", "Su Localizador es ABC123")]),
        ]);
        let phrases = vec!["cita confirmada".to_string(), "localizador".to_string()];
        let found = NavigationManager::wait_for_text(
            &page,
            &phrases,
            Duration::from_secs(15),
            Duration::from_millis(250),
        )
        .await;
        assert_eq!(found.as_deref(), Some("localizador"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_text_times_out() {
        let page = FakePage::new(vec![FakeElement::text("p", "Seleccione oficina")]);
        let phrases = vec!["localizador".to_string()];
        let started = Instant::now();
        let found = NavigationManager::wait_for_text(
            &page,
            &phrases,
            Duration::from_secs(15),
            Duration::from_millis(250),
        )
        .await;
        assert!(found.is_none());
        assert!(started.elapsed() >= Duration::from_secs(15));
    }

    #[tokio::test]
    async fn test_goto_records_navigation() {
        let page = FakePage::new(vec![]);
        let result = NavigationManager::goto(&page, "https://example.test/icpplus", Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(result.url, "https://example.test/icpplus");
        assert_eq!(page.navigations(), vec!["https://example.test/icpplus".to_string()]);
    }
}
