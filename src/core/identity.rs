use crate::errors::{AutobookError, Result};
use crate::types::FlowVariant;
use serde::{Deserialize, Serialize};

/// Personal data submitted to the portal. Loaded once, never mutated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub document_number: String,
    pub full_name: String,
    pub nationality: String,
    pub email: String,
    pub phone: String,
    pub passport_number: Option<String>,
    pub birth_year: Option<String>,
}

// Keeps documents and contact data out of logs.
impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity")
            .field("document_number", &mask(&self.document_number))
            .field("full_name", &"<redacted>")
            .field("nationality", &self.nationality)
            .field("passport_number", &self.passport_number.as_deref().map(mask))
            .field("birth_year", &self.birth_year)
            .finish_non_exhaustive()
    }
}

fn mask(value: &str) -> String {
    let visible: String = value.chars().rev().take(2).collect::<Vec<_>>().into_iter().rev().collect();
    format!("***{}", visible)
}

impl Identity {
    /// Read the identity from the process environment.
    pub fn from_env(variant: FlowVariant) -> Result<Self> {
        Self::from_lookup(variant, |key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as missing.
    pub fn from_lookup<F>(variant: FlowVariant, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let need = |key: &'static str| get(key).ok_or(AutobookError::MissingIdentityField(key));

        let identity = Self {
            document_number: need("NIE_DNI")?,
            full_name: need("FULL_NAME")?,
            nationality: need("NATIONALITY")?,
            email: need("EMAIL")?,
            phone: need("PHONE")?,
            passport_number: get("PASSPORT_NUMBER"),
            birth_year: get("BIRTH_YEAR"),
        };
        identity.validate(variant)?;
        Ok(identity)
    }

    pub fn validate(&self, variant: FlowVariant) -> Result<()> {
        if variant == FlowVariant::Tie {
            if self.passport_number.is_none() {
                return Err(AutobookError::MissingIdentityField("PASSPORT_NUMBER"));
            }
            match self.birth_year.as_deref() {
                None => return Err(AutobookError::MissingIdentityField("BIRTH_YEAR")),
                Some(year) if !is_birth_year(year) => {
                    return Err(AutobookError::InvalidIdentityField {
                        field: "BIRTH_YEAR",
                        reason: format!("expected 4 digits, got '{}'", year),
                    })
                }
                Some(_) => {}
            }
        }
        if !self.email.contains('@') {
            return Err(AutobookError::InvalidIdentityField {
                field: "EMAIL",
                reason: "missing '@'".to_string(),
            });
        }
        Ok(())
    }

    /// Value typed into the main document field for the variant.
    pub fn document_for(&self, variant: FlowVariant) -> String {
        match variant {
            FlowVariant::Nie => self.document_number.to_uppercase(),
            FlowVariant::Tie => self
                .passport_number
                .as_deref()
                .unwrap_or(&self.document_number)
                .to_uppercase(),
        }
    }

    pub fn name_upper(&self) -> String {
        self.full_name.to_uppercase()
    }
}

fn is_birth_year(year: &str) -> bool {
    year.len() == 4 && year.chars().all(|c| c.is_ascii_digit())
}
