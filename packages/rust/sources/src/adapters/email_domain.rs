//! Offline work/personal email classification.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{EnrichError, LookupError, LookupKind, Result};
use regex::Regex;

use super::{RawResponse, SourceAdapter};
use crate::input::NormalizedInput;

const PERSONAL_DOMAINS: &[&str] = &[
    "gmail.com",
    "googlemail.com",
    "yahoo.com",
    "hotmail.com",
    "outlook.com",
    "aol.com",
    "protonmail.com",
    "icloud.com",
    "me.com",
    "mail.com",
    "zoho.com",
    "yandex.com",
    "gmx.com",
    "tutanota.com",
    "mail.ru",
];

/// Provider names matched as a whole domain label at any position.
const PERSONAL_PROVIDERS: &[&str] = &[
    "gmail", "yahoo", "hotmail", "outlook", "live", "msn", "aol", "protonmail", "proton",
    "icloud", "zoho", "yandex", "gmx",
];

/// Classifies an email address as `work` or `personal` from its domain.
pub struct EmailDomainAdapter {
    domains: HashSet<String>,
    providers: Regex,
}

impl EmailDomainAdapter {
    /// Built-in lists plus `extra_domains`.
    pub fn new(extra_domains: &[String]) -> Result<Self> {
        let domains = PERSONAL_DOMAINS
            .iter()
            .map(|d| d.to_string())
            .chain(extra_domains.iter().map(|d| d.trim().to_lowercase()))
            .filter(|d| !d.is_empty())
            .collect();

        let alternatives = PERSONAL_PROVIDERS
            .iter()
            .map(|p| regex::escape(p))
            .collect::<Vec<_>>()
            .join("|");
        let providers = Regex::new(&format!(r"(?i)(^|\.)({alternatives})(\.|$)"))
            .map_err(|e| EnrichError::config(format!("provider pattern: {e}")))?;

        Ok(Self { domains, providers })
    }

    /// `true` for personal mailboxes.
    pub fn is_personal(&self, domain: &str) -> bool {
        let domain = domain.to_lowercase();
        if self.domains.contains(&domain) {
            return true;
        }
        if domain.contains("email") || (domain.contains("mail") && !domain.contains("gmail")) {
            return true;
        }
        self.providers.is_match(&domain)
    }
}

#[async_trait]
impl SourceAdapter for EmailDomainAdapter {
    fn kind(&self) -> LookupKind {
        LookupKind::EmailClass
    }

    fn name(&self) -> &str {
        "email-domain"
    }

    async fn fetch(
        &self,
        input: &NormalizedInput,
        _timeout: Duration,
    ) -> std::result::Result<RawResponse, LookupError> {
        let NormalizedInput::Email { email } = input else {
            return Err(LookupError::MalformedInput(format!(
                "email classification needs an email, got {input:?}"
            )));
        };
        let (_, domain) = email
            .rsplit_once('@')
            .ok_or_else(|| LookupError::MalformedInput("missing '@'".into()))?;

        let class = if self.is_personal(domain) {
            "personal"
        } else {
            "work"
        };

        let mut fields = serde_json::Map::new();
        fields.insert("classification".into(), class.into());
        fields.insert("domain".into(), domain.to_lowercase().into());
        Ok(RawResponse {
            fields,
            discovered_url: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn adapter() -> EmailDomainAdapter {
        EmailDomainAdapter::new(&["example-isp.net".to_string()]).unwrap()
    }

    #[test]
    fn personal_domains() {
        let a = adapter();
        assert!(a.is_personal("gmail.com"));
        assert!(a.is_personal("GMAIL.COM"));
        assert!(a.is_personal("yahoo.co.uk"));
        assert!(a.is_personal("live.fr"));
        assert!(a.is_personal("fastmail.fm"));
        assert!(a.is_personal("example-isp.net"));
    }

    #[test]
    fn work_domains() {
        let a = adapter();
        assert!(!a.is_personal("acme.com"));
        assert!(!a.is_personal("deliveroo.co.uk"));
        // Provider names only count as whole labels.
        assert!(!a.is_personal("livestock.com"));
    }

    #[tokio::test]
    async fn classifies_through_adapter() {
        let raw = adapter()
            .fetch(
                &NormalizedInput::Email {
                    email: "ada@acme.com".into(),
                },
                Duration::from_secs(1),
            )
            .await
            .unwrap();
        assert_eq!(raw.fields["classification"], "work");
        assert_eq!(raw.fields["domain"], "acme.com");
    }
}
