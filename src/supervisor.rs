use crate::actions::Pacer;
use crate::core::{BrowserSession, Config, Identity, SessionFactory};
use crate::monitor::Alarm;
use crate::types::AttemptOutcome;
use crate::utils::ScreenshotRecorder;
use crate::workflow::WorkflowEngine;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{error, info, warn};

/// How the supervisor loop ended.
pub enum SupervisorExit {
    /// The booked session, still open for the person to take over.
    Booked(Box<dyn BrowserSession>),
    Cancelled,
}

impl std::fmt::Debug for SupervisorExit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SupervisorExit::Booked(session) => f.debug_tuple("Booked").field(&session.id()).finish(),
            SupervisorExit::Cancelled => f.write_str("Cancelled"),
        }
    }
}

/// Time left to sleep once the cycle's own duration is discounted, never
/// less than `min`.
pub fn compute_sleep(drawn: Duration, elapsed: Duration, min: Duration) -> Duration {
    drawn.saturating_sub(elapsed).max(min)
}

/// Sleep for `wait`; true when cancelled first.
async fn sleep_or_cancel(wait: Duration, cancel: &mut watch::Receiver<bool>) -> bool {
    let deadline = Instant::now() + wait;
    loop {
        tokio::select! {
            _ = tokio::time::sleep_until(deadline) => return *cancel.borrow(),
            changed = cancel.changed() => {
                if *cancel.borrow() {
                    return true;
                }
                if changed.is_err() {
                    // Nobody can cancel any more.
                    tokio::time::sleep_until(deadline).await;
                    return false;
                }
            }
        }
    }
}

/// Runs booking cycles, each in a fresh browser session, until one books
/// or the process is cancelled.
pub struct CycleSupervisor<F: SessionFactory> {
    config: Arc<Config>,
    identity: Arc<Identity>,
    factory: F,
    alarm: Arc<dyn Alarm>,
    recorder: ScreenshotRecorder,
    pacer: Arc<Pacer>,
}

impl<F: SessionFactory> CycleSupervisor<F> {
    pub fn new(
        config: Arc<Config>,
        identity: Arc<Identity>,
        factory: F,
        alarm: Arc<dyn Alarm>,
        recorder: ScreenshotRecorder,
        pacer: Arc<Pacer>,
    ) -> Self {
        Self {
            config,
            identity,
            factory,
            alarm,
            recorder,
            pacer,
        }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub async fn run_forever(&self, mut cancel: watch::Receiver<bool>) -> SupervisorExit {
        let mut cycle: u64 = 0;
        loop {
            if *cancel.borrow() {
                return SupervisorExit::Cancelled;
            }
            cycle += 1;
            let started = Instant::now();
            info!(cycle, flow = %self.config.flow, "starting cycle");

            if self.config.observability.clear_each_cycle {
                if let Err(e) = self.recorder.reset_dir().await {
                    warn!(error = %e, "could not reset the screenshot directory");
                }
            }

            let outcome = match self.factory.open().await {
                Ok(session) => {
                    let outcome = self.attempt(session.as_ref(), cancel.clone()).await;
                    if outcome == AttemptOutcome::Booked {
                        info!(cycle, session = %session.id(), "booked, leaving the browser open");
                        return SupervisorExit::Booked(session);
                    }
                    let id = session.id().to_string();
                    if let Err(e) = session.close().await {
                        warn!(session = %id, error = %e, "session did not close cleanly");
                    }
                    outcome
                }
                Err(e) => {
                    error!(cycle, error = %e, "could not open a browser session");
                    AttemptOutcome::NotBooked
                }
            };

            if *cancel.borrow() {
                return SupervisorExit::Cancelled;
            }
            let wait = self.next_delay(outcome, started.elapsed());
            info!(cycle, ?outcome, wait_s = wait.as_secs(), "cycle finished, sleeping");

            if sleep_or_cancel(wait, &mut cancel).await {
                return SupervisorExit::Cancelled;
            }
        }
    }

    async fn attempt(&self, session: &dyn BrowserSession, cancel: watch::Receiver<bool>) -> AttemptOutcome {
        let engine = WorkflowEngine::new(
            self.config.clone(),
            self.identity.clone(),
            session.page(),
            self.pacer.clone(),
            self.alarm.clone(),
            self.recorder.clone(),
            cancel,
        );
        engine.run().await
    }

    fn next_delay(&self, outcome: AttemptOutcome, elapsed: Duration) -> Duration {
        let retry = &self.config.retry;
        let range = match outcome {
            AttemptOutcome::Blocked => retry.backoff,
            _ => retry.retry,
        };
        compute_sleep(
            self.pacer.draw(range),
            elapsed,
            Duration::from_millis(retry.min_sleep_ms),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::{DelayRange, PacingConfig};
    use crate::testing::{FakeAlarm, FakeElement, FakePage, FakeScreen, FakeSessionFactory};

    fn identity() -> Identity {
        Identity {
            document_number: "Y1234567X".to_string(),
            full_name: "ANA PEREZ".to_string(),
            nationality: "MARRUECOS".to_string(),
            email: "ana@example.com".to_string(),
            phone: "600111222".to_string(),
            passport_number: None,
            birth_year: None,
        }
    }

    fn supervisor(pages: Vec<Arc<FakePage>>, retry: DelayRange, backoff: DelayRange) -> CycleSupervisor<FakeSessionFactory> {
        let mut config = Config::default();
        config.pacing = PacingConfig::instant();
        config.retry.retry = retry;
        config.retry.backoff = backoff;
        config.retry.min_sleep_ms = 5000;
        let pacer = Arc::new(Pacer::seeded(config.pacing.clone(), 11));
        CycleSupervisor::new(
            Arc::new(config),
            Arc::new(identity()),
            FakeSessionFactory::new(pages),
            Arc::new(FakeAlarm::new(1)),
            ScreenshotRecorder::disabled(),
            pacer,
        )
    }

    fn no_slots_page() -> Arc<FakePage> {
        Arc::new(FakePage::new(vec![FakeElement::text("p", "No hay citas disponibles")]))
    }

    fn bookable_page() -> Arc<FakePage> {
        Arc::new(FakePage::with_screens(vec![
            FakeScreen::new(vec![
                FakeElement::link("21").wrapped(
                    r#"<table class="ui-datepicker-calendar"><tbody><tr><td>"#,
                    "</td></tr></tbody></table>",
                ),
                FakeElement::radio("hora0930", "hora"),
                FakeElement::button("Continuar").goes_to(1),
            ]),
            FakeScreen::new(vec![FakeElement::text("p", "Localizador: 8KQ2")]),
        ]))
    }

    fn blocked_page() -> Arc<FakePage> {
        Arc::new(FakePage::new(vec![FakeElement::text(
            "p",
            "The requested URL was rejected. Please consult with your administrator.",
        )]))
    }

    #[test]
    fn test_compute_sleep() {
        let s = Duration::from_secs;
        assert_eq!(compute_sleep(s(200), s(30), s(5)), s(170));
        assert_eq!(compute_sleep(s(200), s(400), s(5)), s(5));
        assert_eq!(compute_sleep(s(3), s(0), s(5)), s(5));
    }

    #[tokio::test(start_paused = true)]
    async fn test_booked_session_is_kept_open() {
        let first = no_slots_page();
        let second = bookable_page();
        let supervisor = supervisor(
            vec![first.clone(), second.clone()],
            DelayRange::secs(120, 120),
            DelayRange::secs(600, 600),
        );
        let (_tx, rx) = watch::channel(false);

        let exit = supervisor.run_forever(rx).await;
        match exit {
            SupervisorExit::Booked(session) => assert_eq!(session.id(), "fake-2"),
            other => panic!("expected a booking, got {:?}", other),
        }
        assert_eq!(supervisor.factory().opened(), 2);
        assert_eq!(supervisor.factory().live(), 1);
        assert!(first.is_closed());
        assert!(!second.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_interrupts_backoff_sleep() {
        let page = blocked_page();
        let supervisor = supervisor(
            vec![page.clone()],
            DelayRange::secs(120, 120),
            DelayRange::secs(600, 600),
        );
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(60)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let exit = supervisor.run_forever(rx).await;
        assert!(matches!(exit, SupervisorExit::Cancelled));
        assert!(start.elapsed() < Duration::from_secs(600));
        assert_eq!(supervisor.factory().opened(), 1);
        assert_eq!(supervisor.factory().live(), 0);
        assert!(page.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_counts_as_not_booked() {
        let supervisor = supervisor(vec![], DelayRange::secs(1, 1), DelayRange::secs(600, 600));
        let (tx, rx) = watch::channel(false);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            let _ = tx.send(true);
        });

        let start = Instant::now();
        let exit = supervisor.run_forever(rx).await;
        assert!(matches!(exit, SupervisorExit::Cancelled));
        // Floor of five seconds per failed open, not the one-second draw.
        assert!(start.elapsed() >= Duration::from_secs(30));
        assert_eq!(supervisor.factory().opened(), 0);
    }
}
