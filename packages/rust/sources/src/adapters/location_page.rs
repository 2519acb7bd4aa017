//! Subscriber location adapter.
//!
//! Fetches the subscriber page and reads the first element carrying both
//! `data-city` and `data-state` attributes.

use std::sync::LazyLock;
use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{LookupError, LookupKind};
use reqwest::Client;
use scraper::{Html, Selector};
use tracing::debug;

use super::{RawResponse, SourceAdapter};
use crate::http::{send_error, status_error};
use crate::input::NormalizedInput;

static LOCATION_SEL: LazyLock<Selector> =
    LazyLock::new(|| Selector::parse("[data-city][data-state]").expect("valid selector"));

/// Resolves a subscriber's city and state from their page.
pub struct LocationPageAdapter {
    client: Client,
    /// URL template; `{id}` is replaced by the subscriber id.
    template: String,
    cookie: Option<String>,
}

impl LocationPageAdapter {
    pub fn new(client: Client, template: &str, cookie: Option<String>) -> Self {
        Self {
            client,
            template: template.trim().to_string(),
            cookie,
        }
    }

    fn page_url(&self, id: &str) -> String {
        if self.template.contains("{id}") {
            self.template.replace("{id}", id)
        } else {
            format!("{}/{id}", self.template.trim_end_matches('/'))
        }
    }
}

/// Pull `(city, state)` out of a subscriber page.
fn extract_location(html: &str) -> Option<(String, String)> {
    let doc = Html::parse_document(html);
    let el = doc.select(&LOCATION_SEL).next()?;
    let city = el.value().attr("data-city")?.trim().to_string();
    let state = el.value().attr("data-state")?.trim().to_string();
    if city.is_empty() && state.is_empty() {
        return None;
    }
    Some((city, state))
}

#[async_trait]
impl SourceAdapter for LocationPageAdapter {
    fn kind(&self) -> LookupKind {
        LookupKind::Location
    }

    fn name(&self) -> &str {
        "location-page"
    }

    async fn fetch(
        &self,
        input: &NormalizedInput,
        timeout: Duration,
    ) -> Result<RawResponse, LookupError> {
        let NormalizedInput::Subscriber { id } = input else {
            return Err(LookupError::MalformedInput(format!(
                "location lookup needs a subscriber id, got {input:?}"
            )));
        };

        let url = self.page_url(id);
        debug!(subscriber = %id, "fetching subscriber page");

        let mut request = self.client.get(&url).timeout(timeout);
        if let Some(cookie) = &self.cookie {
            request = request.header(reqwest::header::COOKIE, cookie);
        }
        let response = request.send().await.map_err(|e| send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "subscriber page"));
        }
        let body = response
            .text()
            .await
            .map_err(|e| LookupError::Unavailable(format!("subscriber page body: {e}")))?;

        let (city, state) = extract_location(&body)
            .ok_or_else(|| LookupError::NotFound(format!("no location on page for {id}")))?;

        let mut fields = serde_json::Map::new();
        fields.insert("city".into(), city.into());
        fields.insert("state".into(), state.into());
        Ok(RawResponse {
            fields,
            discovered_url: None,
        })
    }
}
