//! Case- and accent-insensitive text matching.

/// Lower-case `text` and strip the diacritics used on the portal.
pub fn fold(text: &str) -> String {
    text.chars()
        .flat_map(char::to_lowercase)
        .map(|c| match c {
            'á' | 'à' | 'â' | 'ä' | 'ã' => 'a',
            'é' | 'è' | 'ê' | 'ë' => 'e',
            'í' | 'ì' | 'î' | 'ï' => 'i',
            'ó' | 'ò' | 'ô' | 'ö' | 'õ' => 'o',
            'ú' | 'ù' | 'û' | 'ü' => 'u',
            'ñ' => 'n',
            'ç' => 'c',
            other => other,
        })
        .collect()
}

/// Collapse runs of whitespace into single spaces.
pub fn squash(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

pub fn contains_folded(haystack: &str, needle: &str) -> bool {
    fold(haystack).contains(&fold(needle))
}

pub fn contains_all<S: AsRef<str>>(haystack: &str, tokens: &[S]) -> bool {
    let folded = fold(haystack);
    tokens.iter().all(|t| folded.contains(&fold(t.as_ref())))
}

pub fn contains_any<S: AsRef<str>>(haystack: &str, tokens: &[S]) -> bool {
    let folded = fold(haystack);
    tokens.iter().any(|t| folded.contains(&fold(t.as_ref())))
}

pub fn contains_none<S: AsRef<str>>(haystack: &str, tokens: &[S]) -> bool {
    !contains_any(haystack, tokens)
}

/// The tokens that occur in `haystack`.
pub fn matching<'a, S: AsRef<str>>(haystack: &str, tokens: &'a [S]) -> Vec<&'a str> {
    let folded = fold(haystack);
    tokens
        .iter()
        .map(AsRef::as_ref)
        .filter(|t| folded.contains(&fold(t)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fold_strips_accents() {
        assert_eq!(fold("Año de NACIMIENTO"), "ano de nacimiento");
        assert_eq!(fold("Presentación sin Cl@ve"), "presentacion sin cl@ve");
        assert_eq!(fold("Alcúdia, Marratxí"), "alcudia, marratxi");
    }

    #[test]
    fn test_token_helpers() {
        let label = "Oficina de Extranjería de Palma de Mallorca";
        assert!(contains_all(label, &["extranjeria", "palma"]));
        assert!(!contains_all(label, &["extranjeria", "ibiza"]));
        assert!(contains_any(label, &["ibiza", "mallorca"]));
        assert!(contains_none(label, &["menorca", "ibiza"]));
        assert_eq!(matching(label, &["palma", "inca", "mallorca"]), vec!["palma", "mallorca"]);
    }

    #[test]
    fn test_squash() {
        assert_eq!(squash("  no hay\n\t citas  "), "no hay citas");
    }
}
