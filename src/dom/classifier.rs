use crate::core::config::{PhraseConfig, PortalConfig, SelectorConfig};
use crate::core::PageDriver;
use crate::dom::snapshot::{PageSnapshot, ParsedSnapshot};
use crate::types::{Classification, FlowVariant, PageState};
use tracing::debug;

/// Answers "which page is this?" from a snapshot, never from memory.
///
/// The portal redirects, bounces back to earlier steps and injects
/// intermediate pages, so every query starts from the live DOM.
#[derive(Debug, Clone)]
pub struct PageClassifier {
    phrases: PhraseConfig,
    selectors: SelectorConfig,
    structural_order: Vec<PageState>,
}

impl PageClassifier {
    /// `structural_order` lists the selector pages in the order the flow
    /// visits them; it decides ties when several selectors share a page.
    pub fn new(portal: &PortalConfig, structural_order: &[PageState]) -> Self {
        Self {
            phrases: portal.phrases.clone(),
            selectors: portal.selectors.clone(),
            structural_order: structural_order.to_vec(),
        }
    }

    pub fn classify(&self, snapshot: &PageSnapshot) -> Classification {
        let page = snapshot.parse();

        // A rejection page can replace any step, so it is checked first.
        if let Some(marker) = page.any_phrase(&self.phrases.block_markers) {
            return Classification::new(PageState::Blocked, vec![marker]);
        }

        if let Some(evidence) = self.identity_evidence(&page) {
            let (variant, radio) = match page.first_css_match(&self.selectors.passport_checked) {
                Some(radio) => (FlowVariant::Tie, radio),
                None => (FlowVariant::Nie, "radio:default".to_string()),
            };
            return Classification::new(PageState::IdentityForm { variant }, vec![evidence, radio]);
        }

        let calendar = page.first_css_match(&self.selectors.calendar);
        let no_slots = page.any_phrase(&self.phrases.no_slots);
        if calendar.is_some() || no_slots.is_some() {
            let evidence = calendar.into_iter().chain(no_slots).collect();
            return Classification::new(PageState::Availability, evidence);
        }

        if let Some(phrase) = page.text_phrase(&self.phrases.confirmation) {
            return Classification::new(PageState::Confirmation, vec![phrase]);
        }

        for state in &self.structural_order {
            if let Some(evidence) = self.structural_evidence(&page, *state) {
                return Classification::new(*state, vec![evidence]);
            }
        }

        if let Some(phrase) = page.text_phrase(&self.phrases.landing) {
            return Classification::new(PageState::Landing, vec![phrase]);
        }

        Classification::unknown()
    }

    /// Classify the live page; a failed snapshot reads as `Unknown`.
    pub async fn classify_page(&self, page: &dyn PageDriver) -> Classification {
        match PageSnapshot::capture(page).await {
            Ok(snapshot) => self.classify(&snapshot),
            Err(e) => {
                debug!(error = %e, "snapshot failed, page state unknown");
                Classification::new(PageState::Unknown, vec![format!("snapshot-error:{}", e)])
            }
        }
    }

    pub fn is_blocked(&self, snapshot: &PageSnapshot) -> bool {
        snapshot
            .parse()
            .any_phrase(&self.phrases.block_markers)
            .is_some()
    }

    pub fn has_identity_form(&self, snapshot: &PageSnapshot) -> bool {
        self.identity_evidence(&snapshot.parse()).is_some()
    }

    pub fn has_calendar(&self, snapshot: &PageSnapshot) -> bool {
        snapshot.parse().has_css(&self.selectors.calendar)
    }

    fn identity_evidence(&self, page: &ParsedSnapshot<'_>) -> Option<String> {
        page.first_css_match(&self.selectors.identity_anchors)
            .or_else(|| page.text_phrase(&self.phrases.tie_identity))
    }

    fn structural_evidence(&self, page: &ParsedSnapshot<'_>, state: PageState) -> Option<String> {
        match state {
            PageState::ProvinceSelect => page.first_css_match(&self.selectors.province),
            PageState::TramiteSelect => page.first_css_match(&self.selectors.tramite),
            PageState::OfficeSelect => page.first_css_match(&self.selectors.office),
            PageState::AuthModeSelect => page.text_phrase(&self.phrases.auth_mode),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const NIE_ORDER: [PageState; 4] = [
        PageState::ProvinceSelect,
        PageState::TramiteSelect,
        PageState::AuthModeSelect,
        PageState::OfficeSelect,
    ];
    const TIE_ORDER: [PageState; 4] = [
        PageState::ProvinceSelect,
        PageState::OfficeSelect,
        PageState::TramiteSelect,
        PageState::AuthModeSelect,
    ];

    fn classifier(order: &[PageState]) -> PageClassifier {
        PageClassifier::new(&PortalConfig::default(), order)
    }

    fn page(html: &str) -> PageSnapshot {
        let text = scraper::Html::parse_document(html)
            .root_element()
            .text()
            .collect::<Vec<_>>()
            .join(" ");
        PageSnapshot::new(html, text)
    }

    #[test]
    fn test_block_marker_wins_over_everything() {
        let snapshot = page(
            r#"<input id="txtIdCitado"><table class="ui-datepicker-calendar"></table>
               <p>The requested URL was rejected. Your support ID is: 1234</p>"#,
        );
        let result = classifier(&NIE_ORDER).classify(&snapshot);
        assert_eq!(result.state, PageState::Blocked);
        assert_eq!(result.evidence, vec!["text:requested url was rejected"]);
    }

    #[test]
    fn test_identity_form_variant_follows_checked_radio() {
        let nie = page(
            r#"<input type="radio" id="rdbTipoDocNie" checked><input type="radio" id="rdbTipoDocPas">
               <input id="txtIdCitado"><input id="txtDesCitado">"#,
        );
        assert_eq!(
            classifier(&NIE_ORDER).classify(&nie).state,
            PageState::IdentityForm { variant: FlowVariant::Nie }
        );

        let tie = page(
            r#"<input type="radio" id="rdbTipoDocNie"><input type="radio" id="rdbTipoDocPas" checked>
               <input id="txtIdCitado"><input id="txtDesCitado">"#,
        );
        assert_eq!(
            classifier(&TIE_ORDER).classify(&tie).state,
            PageState::IdentityForm { variant: FlowVariant::Tie }
        );
    }

    #[test]
    fn test_availability_by_calendar_or_phrase() {
        let by_phrase = page("<p>En este momento no hay citas disponibles.</p>");
        let by_calendar = page(r#"<div class="ui-datepicker"><table></table></div>"#);
        let c = classifier(&NIE_ORDER);
        assert_eq!(c.classify(&by_phrase).state, PageState::Availability);
        assert_eq!(c.classify(&by_calendar).state, PageState::Availability);
        assert!(c.has_calendar(&by_calendar));
        assert!(!c.has_calendar(&by_phrase));
    }

    #[test]
    fn test_confirmation_phrases() {
        let c = classifier(&NIE_ORDER);
        assert_eq!(
            c.classify(&page("<p>Su LOCALIZADOR es ABC123</p>")).state,
            PageState::Confirmation
        );
        assert_eq!(c.classify(&page("<p>Gracias</p>")).state, PageState::Unknown);
    }

    #[test]
    fn test_structural_order_depends_on_flow() {
        let office_and_tramite = page(
            r#"<select id="sede"><option value="1">Palma</option></select>
               <select id="tramiteGrupo[0]"><option value="2">Solicitud</option></select>"#,
        );
        assert_eq!(
            classifier(&NIE_ORDER).classify(&office_and_tramite).state,
            PageState::TramiteSelect
        );
        assert_eq!(
            classifier(&TIE_ORDER).classify(&office_and_tramite).state,
            PageState::OfficeSelect
        );
    }

    #[test]
    fn test_auth_mode_and_landing() {
        let c = classifier(&NIE_ORDER);
        assert_eq!(
            c.classify(&page("<a>Presentación SIN Cl@ve</a><a>Presentación con Cl@ve</a>")).state,
            PageState::AuthModeSelect
        );
        assert_eq!(
            c.classify(&page("<button>Acceder al Procedimiento</button>")).state,
            PageState::Landing
        );
        assert_eq!(
            c.classify(&page(r#"<select id="form"></select>"#)).state,
            PageState::ProvinceSelect
        );
    }
}
