use crate::core::{Locator, PageDriver};
use crate::dom::text::fold;
use crate::errors::Result;
use scraper::{Html, Selector};

/// Point-in-time copy of the page: serialized DOM plus rendered text.
#[derive(Debug, Clone, Default)]
pub struct PageSnapshot {
    pub html: String,
    pub text: String,
}

impl PageSnapshot {
    pub fn new(html: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            html: html.into(),
            text: text.into(),
        }
    }

    pub async fn capture(page: &dyn PageDriver) -> Result<Self> {
        let html = page.content().await?;
        let text = page.body_text().await?;
        Ok(Self { html, text })
    }

    pub fn parse(&self) -> ParsedSnapshot<'_> {
        ParsedSnapshot {
            document: Html::parse_document(&self.html),
            folded_text: fold(&self.text),
            folded_html: fold(&self.html),
            snapshot: self,
        }
    }
}

/// Parsed view used for synchronous probing. Not `Send`; never hold it
/// across an await.
pub struct ParsedSnapshot<'a> {
    snapshot: &'a PageSnapshot,
    document: Html,
    folded_text: String,
    folded_html: String,
}

impl<'a> ParsedSnapshot<'a> {
    pub fn snapshot(&self) -> &'a PageSnapshot {
        self.snapshot
    }

    /// First CSS locator with at least one match. Other locator kinds need a
    /// live page and are ignored here.
    pub fn first_css_match(&self, locators: &[Locator]) -> Option<String> {
        locators.iter().find_map(|locator| match locator {
            Locator::Css { selector } => {
                let parsed = Selector::parse(selector).ok()?;
                self.document
                    .select(&parsed)
                    .next()
                    .map(|_| format!("css:{}", selector))
            }
            _ => None,
        })
    }

    pub fn has_css(&self, locators: &[Locator]) -> bool {
        self.first_css_match(locators).is_some()
    }

    /// First phrase present in the rendered text.
    pub fn text_phrase<S: AsRef<str>>(&self, phrases: &[S]) -> Option<String> {
        phrases
            .iter()
            .map(AsRef::as_ref)
            .find(|p| self.folded_text.contains(&fold(p)))
            .map(|p| format!("text:{}", p))
    }

    /// First phrase present in the text or anywhere in the markup.
    pub fn any_phrase<S: AsRef<str>>(&self, phrases: &[S]) -> Option<String> {
        self.text_phrase(phrases).or_else(|| {
            phrases
                .iter()
                .map(AsRef::as_ref)
                .find(|p| self.folded_html.contains(&fold(p)))
                .map(|p| format!("html:{}", p))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_css_and_phrase_probes() {
        let snapshot = PageSnapshot::new(
            r#"<html><body><select id="form"><option value="">--</option></select>
               <p>En este momento NO HAY CITAS disponibles</p></body></html>"#,
            "En este momento NO HAY CITAS disponibles",
        );
        let parsed = snapshot.parse();
        assert_eq!(
            parsed.first_css_match(&[Locator::css("select#sede"), Locator::css("select#form")]),
            Some("css:select#form".to_string())
        );
        assert!(!parsed.has_css(&[Locator::text("form")]));
        assert_eq!(
            parsed.text_phrase(&["no hay citas"]),
            Some("text:no hay citas".to_string())
        );
    }

    #[test]
    fn test_invalid_selector_is_ignored() {
        let snapshot = PageSnapshot::new("<div></div>", "");
        assert!(!snapshot.parse().has_css(&[Locator::css("div[[")]));
    }

    #[test]
    fn test_phrase_in_markup_only() {
        let snapshot = PageSnapshot::new("<title>The requested URL was rejected</title>", "");
        let parsed = snapshot.parse();
        assert!(parsed.text_phrase(&["requested url was rejected"]).is_none());
        assert_eq!(
            parsed.any_phrase(&["requested url was rejected"]),
            Some("html:requested url was rejected".to_string())
        );
    }
}
