//! Per-kind normalization of record attributes.

use enrichkit_shared::{
    LookupError, LookupKind, RecordId, RecordInput, collapse_whitespace, normalize_email,
    normalize_url,
};
use serde::Serialize;

/// The exact input an adapter receives. Its canonical JSON form is what the
/// lookup fingerprint is computed over, so equal inputs share cache entries.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NormalizedInput {
    /// Contact search by email and display name.
    Person { email: String, name: String },
    /// Bare email address.
    Email { email: String },
    /// Subscriber page keyed by id.
    Subscriber { id: String },
    /// A page URL (normalized).
    Page { url: String },
}

impl NormalizedInput {
    /// Build the input `kind` needs from a record, or explain what is missing.
    pub fn from_record(
        kind: LookupKind,
        record_id: &RecordId,
        input: &RecordInput,
    ) -> Result<Self, LookupError> {
        match kind {
            LookupKind::LinkedinSearch => {
                let email = required_email(input)?;
                let name = input
                    .display_name()
                    .map(|n| collapse_whitespace(&n))
                    .ok_or_else(|| LookupError::MalformedInput("record has no name".into()))?;
                Ok(Self::Person { email, name })
            }
            LookupKind::EmailClass => Ok(Self::Email {
                email: required_email(input)?,
            }),
            LookupKind::Location => {
                let id = record_id.as_str().trim();
                if id.is_empty() {
                    return Err(LookupError::MalformedInput("empty subscriber id".into()));
                }
                Ok(Self::Subscriber { id: id.to_string() })
            }
            LookupKind::ProfilePage => {
                let raw = input
                    .url
                    .as_deref()
                    .ok_or_else(|| LookupError::MalformedInput("record has no url".into()))?;
                let url = normalize_url(raw)
                    .map_err(|e| LookupError::MalformedInput(e.to_string()))?;
                Ok(Self::Page { url })
            }
        }
    }

    /// Canonical serialized form for fingerprinting.
    pub fn canonical(&self) -> String {
        // Plain strings and unit tags; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }
}

fn required_email(input: &RecordInput) -> Result<String, LookupError> {
    let email = input
        .email
        .as_deref()
        .map(normalize_email)
        .ok_or_else(|| LookupError::MalformedInput("record has no email".into()))?;

    match email.split_once('@') {
        Some((local, domain)) if !local.is_empty() && domain.contains('.') => Ok(email),
        _ => Err(LookupError::MalformedInput(format!(
            "'{}' is not an email address",
            enrichkit_shared::mask_email(&email)
        ))),
    }
}
