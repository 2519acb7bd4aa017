//! Profile page adapter for the secondary stage.
//!
//! Fetches a discovered profile URL and extracts the page title and Open Graph
//! metadata.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{LookupError, LookupKind, collapse_whitespace};
use reqwest::Client;
use scraper::{Html, Selector};

use super::{RawResponse, SourceAdapter};
use crate::http::{send_error, status_error};
use crate::input::NormalizedInput;

static TITLE_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("title").expect("valid selector"));
static H1_SEL: LazyLock<Selector> = LazyLock::new(|| Selector::parse("h1").expect("valid selector"));
static META_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("meta[content]").expect("valid selector"));

/// `<meta>` keys copied into the payload, with the field name they map to.
const META_FIELDS: [(&str, &str); 5] = [
    ("og:title", "og_title"),
    ("og:description", "og_description"),
    ("og:url", "og_url"),
    ("og:image", "og_image"),
    ("description", "description"),
];

/// Scrapes public metadata from a profile page.
pub struct ProfilePageAdapter {
    client: Client,
}

impl ProfilePageAdapter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

/// Extract title, first heading and known meta tags.
fn extract_profile(html: &str) -> serde_json::Map<String, serde_json::Value> {
    let doc = Html::parse_document(html);
    let mut fields = serde_json::Map::new();

    let text_of = |sel: &Selector| {
        doc.select(sel)
            .next()
            .map(|el| collapse_whitespace(&el.text().collect::<String>()))
            .filter(|t| !t.is_empty())
    };
    if let Some(title) = text_of(&TITLE_SEL) {
        fields.insert("title".into(), title.into());
    }
    if let Some(heading) = text_of(&H1_SEL) {
        fields.insert("heading".into(), heading.into());
    }

    for el in doc.select(&META_SEL) {
        let attrs = el.value();
        let Some(key) = attrs.attr("property").or_else(|| attrs.attr("name")) else {
            continue;
        };
        let Some((_, field)) = META_FIELDS.iter().find(|(k, _)| k.eq_ignore_ascii_case(key)) else {
            continue;
        };
        let value = attrs.attr("content").map(str::trim).unwrap_or_default();
        if !value.is_empty() && !fields.contains_key(*field) {
            fields.insert((*field).into(), value.into());
        }
    }

    fields
}

#[async_trait]
impl SourceAdapter for ProfilePageAdapter {
    fn kind(&self) -> LookupKind {
        LookupKind::ProfilePage
    }

    fn name(&self) -> &str {
        "profile-page"
    }

    async fn fetch(
        &self,
        input: &NormalizedInput,
        timeout: Duration,
    ) -> Result<RawResponse, LookupError> {
        let NormalizedInput::Page { url } = input else {
            return Err(LookupError::MalformedInput(format!(
                "profile lookup needs a url, got {input:?}"
            )));
        };

        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "profile page"));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LookupError::Unavailable(format!("profile page body: {e}")))?;

        let mut fields = extract_profile(&body);
        if !fields.is_empty() {
            fields.insert("url".into(), url.clone().into());
        }
        Ok(RawResponse {
            fields,
            discovered_url: None,
        })
    }
}
