//! String normalization helpers shared by fingerprints, the work stack and logging.

use url::Url;

use crate::error::{EnrichError, Result};

/// Normalize a URL for deduplication.
///
/// Lowercases scheme and host (done by the parser), drops the fragment and
/// default port, and strips a trailing slash from non-root paths.
pub fn normalize_url(raw: &str) -> Result<String> {
    let mut url = Url::parse(raw.trim())
        .map_err(|e| EnrichError::validation(format!("invalid URL '{raw}': {e}")))?;

    if url.scheme() != "http" && url.scheme() != "https" {
        return Err(EnrichError::validation(format!(
            "unsupported URL scheme '{}'",
            url.scheme()
        )));
    }
    if url.host_str().is_none() {
        return Err(EnrichError::validation(format!("URL '{raw}' has no host")));
    }

    url.set_fragment(None);
    if url.query() == Some("") {
        url.set_query(None);
    }

    let mut s = url.to_string();
    if s.ends_with('/') && url.path() != "/" {
        s.pop();
    }
    Ok(s)
}

/// Lowercase and trim an email address.
pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// Collapse runs of whitespace into single spaces and trim.
pub fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Mask the local part of an email for logging (`jo***@example.com`).
pub fn mask_email(email: &str) -> String {
    match email.split_once('@') {
        Some((local, domain)) => {
            let visible: String = local.chars().take(2).collect();
            format!("{visible}***@{domain}")
        }
        None => "***".into(),
    }
}
