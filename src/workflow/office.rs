use crate::core::config::OfficeFilter;
use crate::dom::text::{contains_any, contains_none};
use crate::types::SelectOption;

/// Options whose label names an allowed office and no denied one.
/// Placeholder options with an empty value never qualify.
pub fn filter_offices(options: &[SelectOption], filter: &OfficeFilter) -> Vec<SelectOption> {
    options
        .iter()
        .filter(|o| !o.value.trim().is_empty())
        .filter(|o| contains_any(&o.text, &filter.allow) && contains_none(&o.text, &filter.deny))
        .cloned()
        .collect()
}
