use crate::actions::{ActionIntent, ActionResolver, OptionChoice, Pacer};
use crate::browser::NavigationManager;
use crate::core::config::PortalConfig;
use crate::core::{Config, Identity, Locator, PageDriver};
use crate::dom::{PageClassifier, PageSnapshot};
use crate::monitor::{wait_for_alert_end, Alarm, Assessment, AvailabilityMonitor};
use crate::types::{AttemptOutcome, Availability, FlowVariant, PageState};
use crate::utils::javascript::{BLUR_ACTIVE, PREPARE_IDENTITY_INPUTS};
use crate::utils::{JavaScriptRunner, ScreenshotRecorder};
use crate::workflow::flow::{FlowPlan, Step, StepKind};
use crate::workflow::office::filter_offices;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Why a cycle stopped early.
#[derive(Debug)]
enum StepFailure {
    Blocked(Vec<String>),
    Failed(String),
    Cancelled,
}

type StepResult<T = ()> = std::result::Result<T, StepFailure>;

fn ms(value: u64) -> Duration {
    Duration::from_millis(value)
}

/// Drives one cycle of a flow against a single page.
pub struct WorkflowEngine {
    config: Arc<Config>,
    identity: Arc<Identity>,
    plan: FlowPlan,
    classifier: PageClassifier,
    monitor: AvailabilityMonitor,
    resolver: ActionResolver,
    alarm: Arc<dyn Alarm>,
    recorder: ScreenshotRecorder,
    cancel: watch::Receiver<bool>,
}

impl WorkflowEngine {
    pub fn new(
        config: Arc<Config>,
        identity: Arc<Identity>,
        page: Arc<dyn PageDriver>,
        pacer: Arc<Pacer>,
        alarm: Arc<dyn Alarm>,
        recorder: ScreenshotRecorder,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let plan = FlowPlan::for_variant(config.flow);
        let classifier = PageClassifier::new(&config.portal, &plan.structural_order());
        let monitor = AvailabilityMonitor::new(&config.portal, config.pacing.poll_interval());
        Self {
            resolver: ActionResolver::new(page, pacer),
            config,
            identity,
            plan,
            classifier,
            monitor,
            alarm,
            recorder,
            cancel,
        }
    }

    fn portal(&self) -> &PortalConfig {
        &self.config.portal
    }

    fn page(&self) -> &dyn PageDriver {
        self.resolver.page()
    }

    fn pacer(&self) -> &Pacer {
        self.resolver.pacer()
    }

    fn variant(&self) -> FlowVariant {
        self.plan.variant
    }

    /// Run the cycle to a terminal outcome. Never fails; every problem is
    /// logged and mapped to `NotBooked` or `Blocked`.
    pub async fn run(&self) -> AttemptOutcome {
        info!(flow = %self.variant(), "cycle started");
        match self.run_steps().await {
            Ok(outcome) => outcome,
            Err(StepFailure::Blocked(evidence)) => {
                warn!(?evidence, "rejected by the portal's bot protection");
                self.snap("blocked").await;
                AttemptOutcome::Blocked
            }
            Err(StepFailure::Failed(reason)) => {
                warn!(%reason, "cycle failed");
                self.snap("failed").await;
                AttemptOutcome::NotBooked
            }
            Err(StepFailure::Cancelled) => {
                info!("cycle cancelled");
                AttemptOutcome::NotBooked
            }
        }
    }

    async fn run_steps(&self) -> StepResult<AttemptOutcome> {
        let url = self.portal().url.clone();
        let timeout = ms(self.config.browser.navigation_timeout_ms);
        match NavigationManager::goto(self.page(), &url, timeout).await {
            Ok(result) => debug!(url = %result.url, duration_ms = result.duration_ms, "landed"),
            Err(e) => {
                self.snap("nav-error").await;
                return Err(StepFailure::Failed(format!("navigation: {}", e)));
            }
        }
        self.pacer().read().await;
        self.snap("landed").await;
        self.resolver.human_scroll().await;
        self.check_block().await?;

        for index in 0..self.plan.steps.len() {
            self.check_cancel()?;
            let step = self.plan.steps[index];
            let current = self.classifier.classify_page(self.page()).await;
            if current.state == PageState::Blocked {
                return Err(StepFailure::Blocked(current.evidence));
            }
            if self.plan.should_skip(index, current.state) {
                info!(step = step.kind.name(), page = %current.state, "page already past this step");
                continue;
            }
            info!(step = step.kind.name(), page = %current.state, evidence = ?current.evidence, "step");

            if step.kind == StepKind::Availability {
                return self.availability().await;
            }
            self.perform_step(step).await?;

            let identity_next = self
                .plan
                .steps
                .get(index + 1)
                .map(|next| next.kind == StepKind::Identity)
                .unwrap_or(false);
            self.after_action(step, identity_next).await?;
        }
        Ok(AttemptOutcome::NotBooked)
    }

    fn check_cancel(&self) -> StepResult {
        if *self.cancel.borrow() {
            Err(StepFailure::Cancelled)
        } else {
            Ok(())
        }
    }

    async fn snapshot(&self) -> PageSnapshot {
        match PageSnapshot::capture(self.page()).await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                debug!(error = %e, "snapshot failed");
                PageSnapshot::default()
            }
        }
    }

    async fn snap(&self, tag: &str) {
        if let Some(path) = self.recorder.snap(self.page(), tag).await {
            debug!(path = %path.display(), "screenshot");
        }
    }

    async fn check_block(&self) -> StepResult {
        let snapshot = self.snapshot().await;
        if self.classifier.is_blocked(&snapshot) {
            return Err(StepFailure::Blocked(vec!["block-marker".to_string()]));
        }
        Ok(())
    }

    /// Settle, record, and handle whatever the last action led to: a block
    /// page ends the cycle, an identity form is filled wherever it appears.
    async fn after_action(&self, step: Step, identity_next: bool) -> StepResult {
        self.pacer().read().await;
        self.snap(&format!("after-{}", step.kind.name())).await;
        self.resolver.human_scroll().await;

        let snapshot = self.snapshot().await;
        if self.classifier.is_blocked(&snapshot) {
            return Err(StepFailure::Blocked(vec![format!("after {}", step.kind.name())]));
        }
        let reached = self.classifier.classify(&snapshot);
        debug!(step = step.kind.name(), page = %reached.state, "after step");

        let form_here = self.classifier.has_identity_form(&snapshot);
        if form_here && step.kind != StepKind::Identity && !identity_next {
            info!(after = step.kind.name(), "identity form showed up, filling it");
            self.fill_and_submit_identity().await?;
            self.check_block().await?;
        }
        Ok(())
    }

    async fn perform_step(&self, step: Step) -> StepResult {
        match step.kind {
            StepKind::Enter => {
                let pattern = self.portal().buttons.enter.clone();
                let outcome = self.resolver.perform(&ActionIntent::click_text(pattern)).await;
                if !outcome.success {
                    debug!(diagnostic = ?outcome.diagnostic, "no entry button, carrying on");
                }
                Ok(())
            }
            StepKind::Province => self.province(step).await,
            StepKind::Tramite => self.tramite(step).await,
            StepKind::SectionTramite => self.section_tramite(step).await,
            StepKind::AuthMode => self.auth_mode().await,
            StepKind::Office => self.office(step).await,
            StepKind::Identity => self.identity_step().await,
            StepKind::RequestAppointment => {
                self.request_appointment().await;
                Ok(())
            }
            StepKind::Availability => Ok(()),
        }
    }

    /// Press the first accept control that works.
    async fn advance(&self, patterns: &[String]) -> bool {
        for pattern in patterns {
            let outcome = self.resolver.perform(&ActionIntent::click_text(pattern.clone())).await;
            if outcome.success {
                return true;
            }
        }
        warn!(?patterns, "no accept control found");
        false
    }

    async fn province(&self, step: Step) -> StepResult {
        let portal = self.portal();
        let selects = portal.selectors.province.clone();
        if !self.resolver.wait_for_any(&selects, ms(portal.waits.province_ms)).await {
            return Err(StepFailure::Failed("province select not found".to_string()));
        }
        let choice = OptionChoice::Contains(portal.province.clone());
        let outcome = self.resolver.perform(&ActionIntent::select(selects, choice)).await;
        if !outcome.success {
            return Err(StepFailure::Failed(format!(
                "province: {}",
                outcome.diagnostic.unwrap_or_default()
            )));
        }
        info!(province = %portal.province, "province selected");
        if step.advance {
            self.advance(&portal.buttons.accept).await;
        }
        Ok(())
    }

    async fn tramite(&self, step: Step) -> StepResult {
        let portal = self.portal();
        let selects = portal.selectors.tramite.clone();
        if !self.resolver.wait_for_any(&selects, ms(portal.waits.tramite_ms)).await {
            return Err(StepFailure::Failed("trámite select not found".to_string()));
        }
        let exact = ActionIntent::select(selects.clone(), OptionChoice::AllTokens(portal.tramite_tokens.clone()));
        let mut outcome = self.resolver.perform(&exact).await;

        if !outcome.success {
            // Some layouts need a group picked before the wanted option appears.
            for token in &portal.tramite_related_tokens {
                let related = ActionIntent::select(selects.clone(), OptionChoice::Contains(token.clone()));
                if self.resolver.perform(&related).await.success {
                    debug!(%token, "picked a related trámite group");
                    outcome = self.resolver.perform(&exact).await;
                    break;
                }
            }
        }
        if !outcome.success {
            return Err(StepFailure::Failed(format!(
                "trámite: {}",
                outcome.diagnostic.unwrap_or_default()
            )));
        }
        info!(tramite = ?outcome.data, "trámite selected");
        if step.advance {
            self.advance(&portal.buttons.after_tramite).await;
        }
        Ok(())
    }

    async fn section_tramite(&self, step: Step) -> StepResult {
        let portal = self.portal();
        let selects = vec![
            Locator::after_text(portal.tie.section_phrases.clone(), "select"),
            Locator::css("select"),
        ];
        let choice = OptionChoice::Contains(portal.tie.section_option.clone());
        let outcome = self.resolver.perform(&ActionIntent::select(selects, choice)).await;
        if !outcome.success {
            return Err(StepFailure::Failed(format!(
                "section trámite: {}",
                outcome.diagnostic.unwrap_or_default()
            )));
        }
        info!(tramite = ?outcome.data, "section trámite selected");
        if step.advance {
            self.advance(&portal.buttons.accept).await;
        }
        Ok(())
    }

    async fn auth_mode(&self) -> StepResult {
        let portal = self.portal();
        let poll = self.config.pacing.poll_interval();
        let shown = NavigationManager::wait_for_text(
            self.page(),
            &portal.phrases.auth_mode,
            ms(portal.waits.auth_mode_ms),
            poll,
        )
        .await;
        if shown.is_none() {
            info!("no auth-mode choice on this path");
            return Ok(());
        }
        let pattern = if portal.use_clave {
            portal.buttons.auth_with_clave.clone()
        } else {
            portal.buttons.auth_without_clave.clone()
        };
        let outcome = self.resolver.perform(&ActionIntent::click_text(pattern)).await;
        if outcome.success {
            info!(with_clave = portal.use_clave, "auth mode chosen");
        } else {
            warn!(diagnostic = ?outcome.diagnostic, "could not choose auth mode");
        }
        Ok(())
    }

    async fn office(&self, step: Step) -> StepResult {
        let portal = self.portal();
        let locate = self.config.pacing.locate_timeout();
        let Some(select) = self.resolver.find_first(&portal.selectors.office, locate).await else {
            info!("no office select on this page");
            return Ok(());
        };
        let options = self.resolver.read_options(&select).await;
        let kept = filter_offices(&options, self.config.office_filter());
        let Some(office) = kept.first() else {
            let seen: Vec<&str> = options.iter().map(|o| o.text.as_str()).collect();
            warn!(?seen, "no office passed the filter");
            return Err(StepFailure::Failed("no acceptable office".to_string()));
        };
        let outcome = self.resolver.choose(&select, office).await;
        if !outcome.success {
            return Err(StepFailure::Failed(format!(
                "office: {}",
                outcome.diagnostic.unwrap_or_default()
            )));
        }
        info!(office = %office.text, "office selected");
        if step.advance {
            self.advance(&portal.buttons.accept).await;
        }
        Ok(())
    }

    async fn identity_step(&self) -> StepResult {
        let (present, _) = {
            let classifier = &self.classifier;
            NavigationManager::wait_for_snapshot(
                self.page(),
                ms(self.portal().waits.identity_ms),
                self.config.pacing.poll_interval(),
                |s| classifier.has_identity_form(s),
            )
            .await
        };
        if !present {
            warn!("identity form did not appear");
            return Ok(());
        }
        self.fill_and_submit_identity().await
    }

    /// Fill the identity form for the flow's variant, verify, and submit.
    /// Nothing is submitted when verification fails.
    async fn fill_and_submit_identity(&self) -> StepResult {
        if !self.fill_identity().await {
            self.snap("identity-unverified").await;
            return Err(StepFailure::Failed("identity fields did not verify".to_string()));
        }
        self.advance(&self.portal().buttons.accept).await;
        self.pacer().read().await;
        self.snap("after-identity").await;
        Ok(())
    }

    /// Fill the identity form; true when every field reads back as intended.
    /// Safe to repeat: each field is cleared before typing.
    pub async fn fill_identity(&self) -> bool {
        self.accept_cookies().await;
        self.snap("identity-start").await;
        let verified = match self.variant() {
            FlowVariant::Nie => self.fill_identity_nie().await,
            FlowVariant::Tie => self.fill_identity_tie().await,
        };
        self.snap("identity-filled").await;
        verified
    }

    async fn accept_cookies(&self) {
        let selectors = &self.portal().selectors;
        if self.resolver.exists(&selectors.cookie_bar).await {
            let outcome = self
                .resolver
                .perform(&ActionIntent::click(selectors.cookie_accept.clone()))
                .await;
            if outcome.success {
                debug!("cookie bar accepted");
            }
        }
    }

    async fn fill_identity_nie(&self) -> bool {
        let selectors = &self.portal().selectors;
        let document = self.identity.document_for(FlowVariant::Nie);
        let name = self.identity.name_upper();

        let radio = self.resolver.perform(&ActionIntent::check(selectors.nie_radio.clone())).await;
        if radio.success {
            self.pacer().micro().await;
        }
        if let Err(e) = JavaScriptRunner::run(self.page(), PREPARE_IDENTITY_INPUTS).await {
            debug!(error = %e, "could not prepare identity inputs");
        }
        self.pacer().micro().await;

        self.resolver
            .perform(&ActionIntent::type_text(selectors.document_field.clone(), document.clone(), "document"))
            .await;
        self.resolver
            .perform(&ActionIntent::type_text(selectors.name_field.clone(), name.clone(), "name"))
            .await;
        let nationality = self.select_nationality().await;
        if let Err(e) = JavaScriptRunner::run(self.page(), BLUR_ACTIVE).await {
            debug!(error = %e, "blur failed");
        }

        self.verify_field(&selectors.document_field, &document, "document").await
            & self.verify_field(&selectors.name_field, &name, "name").await
            & nationality
    }

    /// True when the form has no nationality select or the identity's
    /// country was chosen in it.
    async fn select_nationality(&self) -> bool {
        let selectors = &self.portal().selectors;
        if !self.resolver.exists(&selectors.nationality).await {
            return true;
        }
        let choice = OptionChoice::Contains(self.identity.nationality.clone());
        let outcome = self
            .resolver
            .perform(&ActionIntent::select(selectors.nationality.clone(), choice))
            .await;
        if !outcome.success {
            warn!(diagnostic = ?outcome.diagnostic, nationality = %self.identity.nationality, "nationality not selected");
        }
        outcome.success
    }

    async fn fill_identity_tie(&self) -> bool {
        let portal = self.portal();
        let selectors = &portal.selectors;
        let document = self.identity.document_for(FlowVariant::Tie);
        let name = self.identity.name_upper();
        let year = self.identity.birth_year.clone().unwrap_or_default();

        // A real click makes the portal swap the form to passport mode.
        self.resolver
            .perform(&ActionIntent::click(selectors.passport_radio.clone()))
            .await;
        if !self.passport_checked(ms(portal.waits.passport_checked_ms)).await {
            warn!("passport radio not checked after click, forcing it");
            self.resolver
                .perform(&ActionIntent::check(selectors.passport_radio.clone()))
                .await;
        }

        self.resolver
            .perform(&ActionIntent::type_text(selectors.document_field.clone(), document.clone(), "passport"))
            .await;
        self.resolver
            .perform(&ActionIntent::type_text(selectors.name_field.clone(), name.clone(), "name"))
            .await;
        let typed = self
            .resolver
            .perform(&ActionIntent::type_text(selectors.birth_year_field.clone(), year.clone(), "birth year"))
            .await;
        if !typed.success {
            self.resolver
                .perform(&ActionIntent::set_value(selectors.birth_year_field.clone(), year.clone(), "birth year"))
                .await;
        }

        // Focus changes on this form can flip the radio back.
        self.resolver
            .perform(&ActionIntent::check(selectors.passport_radio.clone()))
            .await;

        let fields = self.verify_field(&selectors.document_field, &document, "passport").await
            & self.verify_field(&selectors.name_field, &name, "name").await
            & self.verify_field(&selectors.birth_year_field, &year, "birth year").await;
        let radio = self.passport_checked(Duration::ZERO).await;
        if !radio {
            warn!("passport radio is not the checked one");
        }
        fields && radio
    }

    async fn passport_checked(&self, wait: Duration) -> bool {
        let selectors = &self.portal().selectors;
        let (checked, _) = NavigationManager::wait_for_snapshot(
            self.page(),
            wait,
            self.config.pacing.poll_interval(),
            |s| s.parse().has_css(&selectors.passport_checked),
        )
        .await;
        checked
    }

    async fn verify_field(&self, field: &[Locator], expected: &str, label: &str) -> bool {
        let actual = self.resolver.input_value(field).await;
        let ok = actual.as_deref() == Some(expected);
        if ok {
            debug!(field = label, "verified");
        } else {
            warn!(field = label, now = ?actual, "field does not hold the intended value");
        }
        ok
    }

    /// Press "Solicitar cita" if it shows up within the wait. Best effort.
    async fn request_appointment(&self) -> bool {
        let portal = self.portal();
        let deadline = Instant::now() + ms(portal.waits.request_appointment_ms);
        let by_label = ActionIntent::click_text(portal.buttons.request_appointment.clone());
        let by_selector = ActionIntent::click(portal.selectors.request_appointment.clone());
        loop {
            if self.resolver.perform(&by_label).await.success {
                info!("requested an appointment");
                return true;
            }
            if self.resolver.exists(&portal.selectors.request_appointment).await
                && self.resolver.perform(&by_selector).await.success
            {
                info!("requested an appointment");
                return true;
            }
            if Instant::now() >= deadline {
                info!("no request-appointment button within the wait");
                return false;
            }
            tokio::time::sleep(self.config.pacing.poll_interval()).await;
        }
    }

    async fn availability(&self) -> StepResult<AttemptOutcome> {
        let (settled, snapshot) = {
            let classifier = &self.classifier;
            let monitor = &self.monitor;
            NavigationManager::wait_for_snapshot(
                self.page(),
                ms(self.portal().waits.availability_ms),
                self.config.pacing.poll_interval(),
                |s| classifier.is_blocked(s) || monitor.assess(s) != Assessment::Pending,
            )
            .await
        };
        if !settled {
            info!("neither calendar nor no-slots notice in time");
            self.snap("no-calendar").await;
        }
        if self.classifier.is_blocked(&snapshot) {
            return Err(StepFailure::Blocked(vec!["availability".to_string()]));
        }

        match self.monitor.evaluate(self.page()).await {
            Availability::Default => {
                info!("no appointments available");
                self.snap("no-slots-default").await;
                return Ok(AttemptOutcome::NotBooked);
            }
            Availability::Anomalous => info!("availability page differs from the usual one"),
        }
        self.check_block().await?;

        let diagnostics = self.alarm.start(self.page()).await;
        info!(?diagnostics, "alert started");
        let poll = ms(self.config.alert.poll_interval_ms);
        let mut cancel = self.cancel.clone();
        wait_for_alert_end(self.alarm.as_ref(), self.page(), poll, &mut cancel)
            .await
            .map_err(|_| StepFailure::Cancelled)?;

        self.book().await
    }

    async fn book(&self) -> StepResult<AttemptOutcome> {
        let portal = self.portal().clone();
        let snapshot = self.snapshot().await;
        if !self.classifier.has_calendar(&snapshot) {
            info!("no calendar after the alert, leaving the page for a manual look");
            self.snap("no-calendar-after-alert").await;
            return Ok(AttemptOutcome::NotBooked);
        }

        let day = self
            .resolver
            .perform(&ActionIntent::click(portal.selectors.calendar_days.clone()))
            .await;
        if !day.success {
            return Err(StepFailure::Failed("no enabled calendar day".to_string()));
        }
        self.pacer().step().await;

        let mut time = self
            .resolver
            .perform(&ActionIntent::click(portal.selectors.time_slots.clone()))
            .await;
        if !time.success {
            time = self
                .resolver
                .perform(&ActionIntent::click_text(portal.buttons.select_time.clone()))
                .await;
        }
        if !time.success {
            return Err(StepFailure::Failed("no time slot".to_string()));
        }
        self.pacer().step().await;

        self.advance(&portal.buttons.continue_booking).await;
        self.pacer().read().await;
        self.snap("before-data-form").await;

        let snapshot = self.snapshot().await;
        if self.classifier.has_identity_form(&snapshot) {
            if !self.fill_identity().await {
                return Err(StepFailure::Failed("final data form did not verify".to_string()));
            }
            if !self.fill_contact().await {
                self.snap("contact-unverified").await;
                return Err(StepFailure::Failed("contact fields did not verify".to_string()));
            }
            self.advance(&portal.buttons.submit).await;
            self.pacer().read().await;
            self.snap("after-data-form").await;
        }

        if self.confirmation_detected(ms(portal.waits.confirmation_ms)).await {
            info!("appointment confirmed, keeping the window open");
            self.snap("confirmed").await;
            Ok(AttemptOutcome::Booked)
        } else {
            warn!("no confirmation text, the appointment may still be booked");
            self.snap("no-confirm-text").await;
            Ok(AttemptOutcome::NotBooked)
        }
    }

    /// Type phone and email into whichever of their fields the form has;
    /// true when every one of them reads back as typed.
    async fn fill_contact(&self) -> bool {
        let selectors = &self.portal().selectors;
        let mut verified = true;
        if self.resolver.exists(&selectors.phone_field).await {
            self.resolver
                .perform(&ActionIntent::type_text(
                    selectors.phone_field.clone(),
                    self.identity.phone.clone(),
                    "phone",
                ))
                .await;
            verified &= self.verify_field(&selectors.phone_field, &self.identity.phone, "phone").await;
        }
        for field in &selectors.email_fields {
            if self.resolver.exists(field).await {
                self.resolver
                    .perform(&ActionIntent::type_text(field.clone(), self.identity.email.clone(), "email"))
                    .await;
                verified &= self.verify_field(field, &self.identity.email, "email").await;
            }
        }
        verified
    }

    /// Whether a confirmation phrase shows up within `wait`.
    pub async fn confirmation_detected(&self, wait: Duration) -> bool {
        NavigationManager::wait_for_text(
            self.page(),
            &self.portal().phrases.confirmation,
            wait,
            self.config.pacing.poll_interval(),
        )
        .await
        .is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::config::PacingConfig;
    use crate::testing::{FakeAlarm, FakeElement, FakePage, FakeScreen, Typing};

    fn identity() -> Identity {
        Identity {
            document_number: "y1234567x".to_string(),
            full_name: "Ana Perez".to_string(),
            nationality: "Marruecos".to_string(),
            email: "ana@example.com".to_string(),
            phone: "600111222".to_string(),
            passport_number: Some("xb123456".to_string()),
            birth_year: Some("1989".to_string()),
        }
    }

    fn engine(
        flow: FlowVariant,
        page: &Arc<FakePage>,
        alarm: Arc<FakeAlarm>,
    ) -> (WorkflowEngine, watch::Sender<bool>) {
        let mut config = Config::default();
        config.flow = flow;
        config.pacing = PacingConfig::instant();
        let pacer = Arc::new(Pacer::seeded(config.pacing.clone(), 3));
        let (tx, rx) = watch::channel(false);
        let engine = WorkflowEngine::new(
            Arc::new(config),
            Arc::new(identity()),
            page.clone(),
            pacer,
            alarm,
            ScreenshotRecorder::disabled(),
            rx,
        );
        (engine, tx)
    }

    fn calendar_day() -> FakeElement {
        FakeElement::link("15").wrapped(
            r#"<table class="ui-datepicker-calendar"><tbody><tr><td>"#,
            "</td></tr></tbody></table>",
        )
    }

    /// Landing through the office page; screen 7 is the availability page.
    fn nie_screens(availability: Vec<FakeScreen>) -> Vec<FakeScreen> {
        let mut screens = vec![
            FakeScreen::new(vec![
                FakeElement::text("h1", "Cita previa extranjería"),
                FakeElement::button("Acceder al Procedimiento").goes_to(1),
            ]),
            FakeScreen::new(vec![
                FakeElement::select("form", &[("", "Seleccione"), ("/icpplus/citar?p=7", "Illes Balears")]),
                FakeElement::button("Aceptar").goes_to(2),
            ]),
            FakeScreen::new(vec![
                FakeElement::select(
                    "tramiteGrupo[0]",
                    &[
                        ("", "Seleccione"),
                        ("4112", "POLICIA-TOMA DE HUELLAS"),
                        ("4010", "POLICIA-CERTIFICADO DE REGISTRO DE CIUDADANO DE LA U.E."),
                    ],
                ),
                FakeElement::button("Aceptar").goes_to(3),
            ]),
            FakeScreen::new(vec![
                FakeElement::link("Presentación CON Cl@ve"),
                FakeElement::link("Presentación SIN Cl@ve").goes_to(4),
            ]),
            FakeScreen::new(vec![
                FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
                FakeElement::input("txtIdCitado"),
                FakeElement::input("txtDesCitado").typing(Typing::Uppercases),
                FakeElement::select("txtPaisNac", &[("", "Seleccione"), ("348", "MARRUECOS")]),
                FakeElement::button("Aceptar").goes_to(5),
            ]),
            FakeScreen::new(vec![FakeElement::input_button("Solicitar Cita").goes_to(6)]),
            FakeScreen::new(vec![
                FakeElement::select(
                    "sede",
                    &[
                        ("", "Seleccione"),
                        ("1", "Oficina Menorca, Maó"),
                        ("2", "Oficina Palma de Mallorca"),
                        ("3", "Oficina Ibiza"),
                    ],
                ),
                FakeElement::button("Siguiente").goes_to(7),
            ]),
        ];
        screens.extend(availability);
        screens
    }

    fn no_slots() -> FakeScreen {
        FakeScreen::new(vec![FakeElement::text(
            "p",
            "En este momento no hay citas disponibles.",
        )])
    }

    #[tokio::test(start_paused = true)]
    async fn test_nie_no_slots_ends_quietly() {
        let page = Arc::new(FakePage::with_screens(nie_screens(vec![no_slots()])));
        let alarm = Arc::new(FakeAlarm::new(1));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 7);
        assert_eq!(alarm.starts(), 0);
        assert_eq!(page.value_of("form").as_deref(), Some("/icpplus/citar?p=7"));
        assert_eq!(page.value_of("tramiteGrupo[0]").as_deref(), Some("4010"));
        assert_eq!(page.value_of("txtIdCitado").as_deref(), Some("Y1234567X"));
        assert_eq!(page.value_of("txtDesCitado").as_deref(), Some("ANA PEREZ"));
        assert_eq!(page.value_of("txtPaisNac").as_deref(), Some("348"));
        // Deny list wins over the allow list.
        assert_eq!(page.value_of("sede").as_deref(), Some("2"));
        assert_eq!(page.navigations().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_nie_calendar_alerts_then_books() {
        let calendar = FakeScreen::new(vec![
            FakeElement::text("p", "Seleccione una fecha"),
            calendar_day(),
            FakeElement::radio("hora1", "hora"),
            FakeElement::button("Continuar").goes_to(8),
        ]);
        let data_form = FakeScreen::new(vec![
            FakeElement::input("txtIdCitado").value("Y1234567X"),
            FakeElement::input("txtDesCitado"),
            FakeElement::input("txtTelefonoCitado"),
            FakeElement::input("emailUNO"),
            FakeElement::input("emailDOS"),
            FakeElement::button("Confirmar").goes_to(9),
        ]);
        let confirmed = FakeScreen::new(vec![FakeElement::text(
            "p",
            "Cita confirmada. Localizador: 4F7A2",
        )]);
        let page = Arc::new(FakePage::with_screens(nie_screens(vec![
            calendar, data_form, confirmed,
        ])));
        let alarm = Arc::new(FakeAlarm::new(3));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        assert_eq!(engine.run().await, AttemptOutcome::Booked);
        assert_eq!(alarm.starts(), 1);
        assert_eq!(alarm.polls(), 3);
        assert!(page.clicks().contains(&"15".to_string()));
        assert!(page.is_checked_id("hora1"));
        assert_eq!(page.value_of("txtTelefonoCitado").as_deref(), Some("600111222"));
        assert_eq!(page.value_of("emailDOS").as_deref(), Some("ana@example.com"));
        assert_eq!(page.current_screen(), 9);
        assert!(!page.is_closed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_missing_confirmation_is_not_booked() {
        let calendar = FakeScreen::new(vec![
            calendar_day(),
            FakeElement::radio("hora1", "hora"),
            FakeElement::button("Continuar").goes_to(8),
        ]);
        let after = FakeScreen::new(vec![FakeElement::text("p", "Gracias")]);
        let page = Arc::new(FakePage::with_screens(nie_screens(vec![calendar, after])));
        let alarm = Arc::new(FakeAlarm::new(1));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        let start = Instant::now();
        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(alarm.starts(), 1);
        assert!(start.elapsed() >= ms(Config::default().portal.waits.confirmation_ms));
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_page_stops_the_cycle() {
        let page = Arc::new(FakePage::with_screens(vec![FakeScreen::new(vec![
            FakeElement::text("h1", "Request Rejected"),
            FakeElement::text("p", "The requested URL was rejected. Please consult with your administrator."),
            FakeElement::text("p", "Your support ID is: 1234567890"),
        ])]));
        let alarm = Arc::new(FakeAlarm::new(1));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        assert_eq!(engine.run().await, AttemptOutcome::Blocked);
        assert!(page.clicks().is_empty());
        assert_eq!(alarm.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_block_page_mid_flow() {
        let mut screens = nie_screens(vec![no_slots()]);
        screens[2] = FakeScreen::new(vec![FakeElement::text(
            "p",
            "The requested URL was rejected.",
        )]);
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::Blocked);
        assert_eq!(page.current_screen(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unverified_identity_is_not_submitted() {
        let mut screens = nie_screens(vec![no_slots()]);
        screens[4] = FakeScreen::new(vec![
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
            FakeElement::input("txtIdCitado"),
            FakeElement::input("txtDesCitado").typing(Typing::RejectsAll),
            FakeElement::button("Aceptar").id("btnEnviar").goes_to(5),
        ]);
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 4);
        assert!(!page.clicks().contains(&"btnEnviar".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_unmatched_nationality_is_not_submitted() {
        let mut screens = nie_screens(vec![no_slots()]);
        screens[4] = FakeScreen::new(vec![
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
            FakeElement::input("txtIdCitado"),
            FakeElement::input("txtDesCitado"),
            FakeElement::select("txtPaisNac", &[("", "Seleccione"), ("120", "POLONIA")]),
            FakeElement::button("Aceptar").id("btnEnviar").goes_to(5),
        ]);
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 4);
        assert_eq!(page.value_of("txtPaisNac").as_deref(), Some(""));
        assert!(!page.clicks().contains(&"btnEnviar".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_phone_blocks_final_submit() {
        let calendar = FakeScreen::new(vec![
            calendar_day(),
            FakeElement::radio("hora1", "hora"),
            FakeElement::button("Continuar").goes_to(8),
        ]);
        let data_form = FakeScreen::new(vec![
            FakeElement::input("txtIdCitado").value("Y1234567X"),
            FakeElement::input("txtDesCitado"),
            FakeElement::input("txtTelefonoCitado").typing(Typing::RejectsAll),
            FakeElement::input("emailUNO"),
            FakeElement::button("Confirmar").id("btnSubmit").goes_to(9),
        ]);
        let confirmed = FakeScreen::new(vec![FakeElement::text("p", "Cita confirmada. Localizador: 4F7A2")]);
        let page = Arc::new(FakePage::with_screens(nie_screens(vec![
            calendar, data_form, confirmed,
        ])));
        let alarm = Arc::new(FakeAlarm::new(1));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(alarm.starts(), 1);
        assert_eq!(page.current_screen(), 8);
        assert_eq!(page.value_of("txtTelefonoCitado").as_deref(), Some(""));
        assert!(!page.clicks().contains(&"btnSubmit".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_identity_form_after_request_is_refilled() {
        // "Solicitar Cita" bounces back to a fresh copy of the identity form.
        let bounced = FakeScreen::new(vec![
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
            FakeElement::input("txtIdCitado").value("OLD"),
            FakeElement::input("txtDesCitado"),
            FakeElement::select("txtPaisNac", &[("", "Seleccione"), ("348", "MARRUECOS")]),
            FakeElement::button("Aceptar").id("btnEnviar2").goes_to(6),
        ]);
        let mut screens = nie_screens(vec![no_slots(), bounced]);
        screens[5] = FakeScreen::new(vec![FakeElement::input_button("Solicitar Cita").goes_to(8)]);
        let page = Arc::new(FakePage::with_screens(screens));
        let alarm = Arc::new(FakeAlarm::new(1));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 7);
        assert!(page.clicks().contains(&"btnEnviar2".to_string()));
        let log = page.log();
        let bounce = log.iter().position(|l| l == "screen:8").unwrap();
        assert!(log[bounce..].contains(&"screen:6".to_string()));
        assert_eq!(page.value_of("sede").as_deref(), Some("2"));
        assert_eq!(alarm.starts(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_landing_on_a_later_page_skips_earlier_steps() {
        // The portal sometimes lands straight on the trámite page.
        let mut screens = nie_screens(vec![no_slots()]);
        screens[0] = FakeScreen::new(vec![]).advance_after(Duration::ZERO, 2);
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 7);
        assert_eq!(page.value_of("form").as_deref(), Some(""));
        assert_eq!(page.value_of("sede").as_deref(), Some("2"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_no_acceptable_office_fails_cycle() {
        let mut screens = nie_screens(vec![no_slots()]);
        screens[6] = FakeScreen::new(vec![
            FakeElement::select("sede", &[("", "Seleccione"), ("3", "Oficina Ibiza")]),
            FakeElement::button("Siguiente").goes_to(7),
        ]);
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 6);
        assert_eq!(page.value_of("sede").as_deref(), Some(""));
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_during_alert() {
        let calendar = FakeScreen::new(vec![calendar_day(), FakeElement::radio("hora1", "hora")]);
        let page = Arc::new(FakePage::with_screens(nie_screens(vec![calendar])));
        let alarm = Arc::new(FakeAlarm::endless());
        let (engine, tx) = engine(FlowVariant::Nie, &page, alarm.clone());

        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(600)).await;
            let _ = tx.send(true);
        });
        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(alarm.starts(), 1);
        assert!(alarm.polls() > 1);
        assert!(!page.clicks().contains(&"15".to_string()));
    }

    #[tokio::test(start_paused = true)]
    async fn test_nie_identity_fill_is_idempotent() {
        let page = Arc::new(FakePage::new(vec![
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc"),
            FakeElement::input("txtIdCitado").value("OLD"),
            FakeElement::input("txtDesCitado"),
        ]));
        let (engine, _tx) = engine(FlowVariant::Nie, &page, Arc::new(FakeAlarm::new(1)));

        assert!(engine.fill_identity().await);
        assert!(engine.fill_identity().await);
        assert_eq!(page.value_of("txtIdCitado").as_deref(), Some("Y1234567X"));
        assert_eq!(page.value_of("txtDesCitado").as_deref(), Some("ANA PEREZ"));
        assert!(page.is_checked_id("rdbTipoDocNie"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_passport_radio_survives_focus_changes() {
        let page = Arc::new(FakePage::new(vec![
            FakeElement::text("p", "Tipo de documento"),
            FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc").checked().label("N.I.E."),
            FakeElement::radio("rdbTipoDocPas", "rdbTipoDoc").label("Pasaporte"),
            FakeElement::input("txtIdCitado"),
            FakeElement::input("txtDesCitado"),
            FakeElement::text("span", "Año de nacimiento"),
            FakeElement::input("txtAnnoCitado").on_focus_check("rdbTipoDocNie"),
        ]));
        let (engine, _tx) = engine(FlowVariant::Tie, &page, Arc::new(FakeAlarm::new(1)));

        assert!(engine.fill_identity().await);
        assert!(page.is_checked_id("rdbTipoDocPas"));
        assert!(!page.is_checked_id("rdbTipoDocNie"));
        assert_eq!(page.value_of("txtIdCitado").as_deref(), Some("XB123456"));
        assert_eq!(page.value_of("txtAnnoCitado").as_deref(), Some("1989"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_tie_flow_reaches_availability() {
        let screens = vec![
            FakeScreen::new(vec![FakeElement::button("Acceder al Procedimiento").goes_to(1)]),
            FakeScreen::new(vec![
                FakeElement::select("form", &[("", "Seleccione"), ("/icpplus/citar?p=7", "Illes Balears")]),
                FakeElement::button("Aceptar").goes_to(2),
            ]),
            FakeScreen::new(vec![
                FakeElement::select(
                    "sede",
                    &[
                        ("", "Cualquier oficina"),
                        ("99", "Oficina de Extranjería de Palma, Ciudad de Querétaro s/n"),
                    ],
                ),
                FakeElement::text("h3", "Trámites Oficinas de Extranjería"),
                FakeElement::select(
                    "tramiteGrupo[0]",
                    &[
                        ("", "Seleccione"),
                        ("4038", "SOLICITUD AUTORIZACIONES"),
                    ],
                ),
                FakeElement::button("Aceptar").goes_to(3),
            ]),
            FakeScreen::new(vec![FakeElement::link("Presentación SIN Cl@ve").goes_to(4)]),
            FakeScreen::new(vec![
                FakeElement::text("p", "Tipo de documento"),
                FakeElement::radio("rdbTipoDocNie", "rdbTipoDoc").checked().label("N.I.E."),
                FakeElement::radio("rdbTipoDocPas", "rdbTipoDoc").label("Pasaporte"),
                FakeElement::input("txtIdCitado"),
                FakeElement::input("txtDesCitado"),
                FakeElement::text("span", "Año de nacimiento"),
                FakeElement::input("txtAnnoCitado"),
                FakeElement::button("Aceptar").goes_to_if_checked("rdbTipoDocPas", 5, 4),
            ]),
            FakeScreen::new(vec![FakeElement::input_button("Solicitar Cita").goes_to(6)]),
            no_slots(),
        ];
        let page = Arc::new(FakePage::with_screens(screens));
        let (engine, _tx) = engine(FlowVariant::Tie, &page, Arc::new(FakeAlarm::new(1)));

        assert_eq!(engine.run().await, AttemptOutcome::NotBooked);
        assert_eq!(page.current_screen(), 6);
        assert_eq!(page.value_of("sede").as_deref(), Some("99"));
        assert_eq!(page.value_of("tramiteGrupo[0]").as_deref(), Some("4038"));
        assert_eq!(page.value_of("txtAnnoCitado").as_deref(), Some("1989"));
    }
}
