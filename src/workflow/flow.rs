use crate::types::{FlowVariant, PageState};
use serde::{Deserialize, Serialize};

/// One named step of a flow.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StepKind {
    Enter,
    Province,
    Tramite,
    /// TIE: the trámite select that follows the section heading.
    SectionTramite,
    AuthMode,
    Office,
    Identity,
    RequestAppointment,
    Availability,
}

impl StepKind {
    /// The page this step acts on. `RequestAppointment` is a button on
    /// whatever page follows the identity submit and has no state of its own.
    pub fn target(&self) -> Option<PageState> {
        match self {
            StepKind::Enter => Some(PageState::Landing),
            StepKind::Province => Some(PageState::ProvinceSelect),
            StepKind::Tramite | StepKind::SectionTramite => Some(PageState::TramiteSelect),
            StepKind::AuthMode => Some(PageState::AuthModeSelect),
            StepKind::Office => Some(PageState::OfficeSelect),
            StepKind::Identity => Some(PageState::IdentityForm {
                variant: FlowVariant::Nie,
            }),
            StepKind::RequestAppointment => None,
            StepKind::Availability => Some(PageState::Availability),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            StepKind::Enter => "enter",
            StepKind::Province => "province",
            StepKind::Tramite => "tramite",
            StepKind::SectionTramite => "section-tramite",
            StepKind::AuthMode => "auth-mode",
            StepKind::Office => "office",
            StepKind::Identity => "identity",
            StepKind::RequestAppointment => "request-appointment",
            StepKind::Availability => "availability",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Step {
    pub kind: StepKind,
    /// Press the accept control after the selection.
    pub advance: bool,
}

impl Step {
    const fn new(kind: StepKind) -> Self {
        Self {
            kind,
            advance: true,
        }
    }

    const fn staying(kind: StepKind) -> Self {
        Self {
            kind,
            advance: false,
        }
    }
}

/// Ordered steps and page ranks for one variant.
///
/// A step is skipped when the live page already ranks past the page the
/// step targets, which is how bounces and pre-filled pages are absorbed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlowPlan {
    pub variant: FlowVariant,
    pub steps: Vec<Step>,
    state_order: Vec<PageState>,
}

// The NIE identity form has no step of its own: it is filled wherever it
// shows up, usually right after the auth-mode page.
const NIE_STEPS: [Step; 8] = [
    Step::new(StepKind::Enter),
    Step::new(StepKind::Province),
    Step::new(StepKind::Tramite),
    Step::new(StepKind::AuthMode),
    Step::new(StepKind::RequestAppointment),
    Step::new(StepKind::Office),
    Step::new(StepKind::RequestAppointment),
    Step::new(StepKind::Availability),
];

// The TIE office select shares its page with the trámite select, so
// choosing the office must not submit it.
const TIE_STEPS: [Step; 8] = [
    Step::new(StepKind::Enter),
    Step::new(StepKind::Province),
    Step::staying(StepKind::Office),
    Step::new(StepKind::SectionTramite),
    Step::new(StepKind::AuthMode),
    Step::new(StepKind::Identity),
    Step::new(StepKind::RequestAppointment),
    Step::new(StepKind::Availability),
];

fn identity() -> PageState {
    PageState::IdentityForm {
        variant: FlowVariant::Nie,
    }
}

impl FlowPlan {
    pub fn for_variant(variant: FlowVariant) -> Self {
        let (steps, state_order) = match variant {
            FlowVariant::Nie => (
                NIE_STEPS.to_vec(),
                vec![
                    PageState::Landing,
                    PageState::ProvinceSelect,
                    PageState::TramiteSelect,
                    PageState::AuthModeSelect,
                    identity(),
                    PageState::OfficeSelect,
                    PageState::Availability,
                    PageState::Confirmation,
                ],
            ),
            FlowVariant::Tie => (
                TIE_STEPS.to_vec(),
                vec![
                    PageState::Landing,
                    PageState::ProvinceSelect,
                    PageState::OfficeSelect,
                    PageState::TramiteSelect,
                    PageState::AuthModeSelect,
                    identity(),
                    PageState::Availability,
                    PageState::Confirmation,
                ],
            ),
        };
        Self {
            variant,
            steps,
            state_order,
        }
    }

    /// Position of `state` in the flow; identity forms rank the same
    /// whatever their variant. Off-flow states have no rank.
    pub fn rank(&self, state: PageState) -> Option<usize> {
        let state = if state.is_identity_form() { identity() } else { state };
        self.state_order.iter().position(|s| *s == state)
    }

    /// The selector-identified pages in flow order, for the classifier.
    pub fn structural_order(&self) -> Vec<PageState> {
        self.state_order
            .iter()
            .copied()
            .filter(|s| {
                matches!(
                    s,
                    PageState::ProvinceSelect
                        | PageState::TramiteSelect
                        | PageState::AuthModeSelect
                        | PageState::OfficeSelect
                )
            })
            .collect()
    }

    /// Whether the step at `index` can be skipped given the live page.
    pub fn should_skip(&self, index: usize, current: PageState) -> bool {
        let Some(step) = self.steps.get(index) else {
            return true;
        };
        let Some(current_rank) = self.rank(current) else {
            return false;
        };
        match step.kind.target() {
            Some(target) => self.rank(target).map(|t| current_rank > t).unwrap_or(false),
            // Already at or past whatever the button leads to.
            None => self
                .steps
                .get(index + 1)
                .and_then(|next| next.kind.target())
                .and_then(|t| self.rank(t))
                .map(|t| current_rank >= t)
                .unwrap_or(false),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(plan: &FlowPlan) -> Vec<StepKind> {
        plan.steps.iter().map(|s| s.kind).collect()
    }

    #[test]
    fn test_nie_and_tie_orders() {
        let nie = FlowPlan::for_variant(FlowVariant::Nie);
        assert_eq!(
            kinds(&nie),
            vec![
                StepKind::Enter,
                StepKind::Province,
                StepKind::Tramite,
                StepKind::AuthMode,
                StepKind::RequestAppointment,
                StepKind::Office,
                StepKind::RequestAppointment,
                StepKind::Availability,
            ]
        );
        let tie = FlowPlan::for_variant(FlowVariant::Tie);
        assert_eq!(tie.steps[2], Step::staying(StepKind::Office));
        assert_eq!(
            tie.structural_order(),
            vec![
                PageState::ProvinceSelect,
                PageState::OfficeSelect,
                PageState::TramiteSelect,
                PageState::AuthModeSelect,
            ]
        );
    }

    #[test]
    fn test_identity_rank_ignores_variant() {
        let plan = FlowPlan::for_variant(FlowVariant::Nie);
        let tie_form = PageState::IdentityForm {
            variant: FlowVariant::Tie,
        };
        assert_eq!(plan.rank(tie_form), plan.rank(identity()));
        assert_eq!(plan.rank(PageState::Blocked), None);
    }

    #[test]
    fn test_skip_rule() {
        let plan = FlowPlan::for_variant(FlowVariant::Nie);
        // Province step while the trámite page is already showing.
        assert!(plan.should_skip(1, PageState::TramiteSelect));
        // Never skip the step whose page is showing.
        assert!(!plan.should_skip(1, PageState::ProvinceSelect));
        // Unknown pages never cause skips.
        assert!(!plan.should_skip(3, PageState::Unknown));
        // Request-appointment skips once the page it leads to shows.
        assert!(plan.should_skip(4, PageState::OfficeSelect));
        assert!(!plan.should_skip(4, identity()));
        assert!(plan.should_skip(6, PageState::Availability));
        assert!(!plan.should_skip(6, PageState::OfficeSelect));
    }

    #[test]
    fn test_tie_office_not_skipped_on_shared_page() {
        let plan = FlowPlan::for_variant(FlowVariant::Tie);
        // The shared page classifies as office in the TIE order.
        assert!(!plan.should_skip(2, PageState::OfficeSelect));
        assert!(!plan.should_skip(3, PageState::OfficeSelect));
    }
}
