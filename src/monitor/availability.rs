use crate::core::config::PortalConfig;
use crate::core::{Locator, PageDriver};
use crate::dom::PageSnapshot;
use crate::errors::{AutobookError, Result};
use crate::monitor::alert::Alarm;
use crate::types::Availability;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Reading of a single availability snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Assessment {
    Default,
    Anomalous,
    /// Neither a calendar nor a no-slots phrase yet.
    Pending,
}

/// Decides whether the availability page is the usual "no appointments"
/// page or something worth a human's attention.
#[derive(Debug, Clone)]
pub struct AvailabilityMonitor {
    calendar: Vec<Locator>,
    no_slots: Vec<String>,
    settle: Duration,
    poll: Duration,
}

impl AvailabilityMonitor {
    pub fn new(portal: &PortalConfig, poll: Duration) -> Self {
        Self {
            calendar: portal.selectors.calendar.clone(),
            no_slots: portal.phrases.no_slots.clone(),
            settle: Duration::from_millis(portal.waits.availability_settle_ms),
            poll,
        }
    }

    /// A calendar is always anomalous, even next to a no-slots notice.
    pub fn assess(&self, snapshot: &PageSnapshot) -> Assessment {
        let page = snapshot.parse();
        if page.has_css(&self.calendar) {
            Assessment::Anomalous
        } else if page.any_phrase(&self.no_slots).is_some() {
            Assessment::Default
        } else {
            Assessment::Pending
        }
    }

    /// Re-read a still-rendering page until the settle window closes; a page
    /// that never shows a recognised state is treated as anomalous.
    pub async fn evaluate(&self, page: &dyn PageDriver) -> Availability {
        let deadline = Instant::now() + self.settle;
        loop {
            let assessment = match PageSnapshot::capture(page).await {
                Ok(snapshot) => self.assess(&snapshot),
                Err(e) => {
                    debug!(error = %e, "availability snapshot failed");
                    Assessment::Pending
                }
            };
            match assessment {
                Assessment::Default => return Availability::Default,
                Assessment::Anomalous => return Availability::Anomalous,
                Assessment::Pending if Instant::now() >= deadline => {
                    warn!("availability page never settled, treating it as anomalous");
                    return Availability::Anomalous;
                }
                Assessment::Pending => tokio::time::sleep(self.poll).await,
            }
        }
    }
}

/// Block until the alarm finishes. There is no timeout: a person is
/// expected to take over, so only cancellation ends the wait early.
pub async fn wait_for_alert_end(
    alarm: &dyn Alarm,
    page: &dyn PageDriver,
    poll: Duration,
    cancel: &mut watch::Receiver<bool>,
) -> Result<()> {
    loop {
        if *cancel.borrow() {
            return Err(AutobookError::Cancelled);
        }
        match alarm.has_ended(page).await {
            Ok(true) => {
                info!("alarm finished");
                return Ok(());
            }
            Ok(false) => {}
            Err(e) => debug!(error = %e, "alarm state unreadable"),
        }
        tokio::select! {
            _ = tokio::time::sleep(poll) => {}
            changed = cancel.changed() => {
                // Sender gone: nobody can cancel any more, keep polling.
                if changed.is_err() {
                    tokio::time::sleep(poll).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{FakeAlarm, FakeElement, FakePage, FakeScreen};

    fn monitor() -> AvailabilityMonitor {
        AvailabilityMonitor::new(&PortalConfig::default(), Duration::from_millis(500))
    }

    fn calendar_day() -> FakeElement {
        FakeElement::link("15").wrapped(
            r#"<table class="ui-datepicker-calendar"><tbody><tr><td>"#,
            "</td></tr></tbody></table>",
        )
    }

    #[tokio::test]
    async fn test_no_slots_phrase_is_default() {
        let page = FakePage::new(vec![FakeElement::text(
            "p",
            "En este momento no hay citas disponibles.",
        )]);
        assert_eq!(monitor().evaluate(&page).await, Availability::Default);
    }

    #[tokio::test]
    async fn test_calendar_wins_over_phrase() {
        let page = FakePage::new(vec![
            FakeElement::text("p", "No hay citas disponibles"),
            calendar_day(),
        ]);
        assert_eq!(monitor().evaluate(&page).await, Availability::Anomalous);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pending_page_waits_for_phrase() {
        let page = FakePage::with_screens(vec![
            FakeScreen::new(vec![FakeElement::text("p", "Cargando...")])
                .advance_after(Duration::from_secs(3), 1),
            FakeScreen::new(vec![FakeElement::text("p", "No hay citas disponibles")]),
        ]);
        assert_eq!(monitor().evaluate(&page).await, Availability::Default);
    }

    #[tokio::test(start_paused = true)]
    async fn test_page_that_never_settles_is_anomalous() {
        let page = FakePage::new(vec![FakeElement::text("p", "Seleccione una fecha")]);
        let started = Instant::now();
        assert_eq!(monitor().evaluate(&page).await, Availability::Anomalous);
        assert!(started.elapsed() >= Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_alert_end_polls_until_done() {
        let page = FakePage::new(vec![]);
        let alarm = FakeAlarm::new(3);
        let (_tx, mut rx) = watch::channel(false);
        wait_for_alert_end(&alarm, &page, Duration::from_secs(1), &mut rx)
            .await
            .unwrap();
        assert_eq!(alarm.polls(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_for_alert_end_is_cancellable() {
        let page = FakePage::new(vec![]);
        let alarm = FakeAlarm::endless();
        let (tx, mut rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(true);
        });
        let result = wait_for_alert_end(&alarm, &page, Duration::from_secs(1), &mut rx).await;
        assert!(matches!(result, Err(AutobookError::Cancelled)));
    }
}
