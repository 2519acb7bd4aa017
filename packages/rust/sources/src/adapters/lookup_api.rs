//! Profile lookup API adapter (`GET {base}/{email}/{name}`).

use std::time::Duration;

use async_trait::async_trait;
use enrichkit_shared::{EnrichError, LookupError, LookupKind, Result, mask_email};
use reqwest::Client;
use serde::Deserialize;
use tracing::debug;
use url::Url;

use super::{RawResponse, SourceAdapter};
use crate::http::{send_error, status_error};
use crate::input::NormalizedInput;

/// Header carrying the API key.
const API_KEY_HEADER: &str = "X-API-Key";

/// One result item. The API answers with a list and only the first item counts.
#[derive(Debug, Deserialize)]
struct LookupItem {
    #[serde(default)]
    success: bool,
    linkedin_url: Option<String>,
    method_used: Option<String>,
    processing_time_ms: Option<u64>,
    error_message: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum LookupBody {
    List(Vec<LookupItem>),
    Single(LookupItem),
}

/// Finds a LinkedIn profile URL for a person through the lookup API.
pub struct LookupApiAdapter {
    client: Client,
    base: Url,
    api_key: String,
}

impl LookupApiAdapter {
    pub fn new(client: Client, base_url: &str, api_key: impl Into<String>) -> Result<Self> {
        let base = Url::parse(base_url.trim())
            .map_err(|e| EnrichError::config(format!("invalid lookup API url '{base_url}': {e}")))?;
        if base.cannot_be_a_base() {
            return Err(EnrichError::config(format!(
                "lookup API url '{base_url}' cannot take path segments"
            )));
        }
        Ok(Self {
            client,
            base,
            api_key: api_key.into(),
        })
    }

    fn endpoint(&self, email: &str, name: &str) -> std::result::Result<Url, LookupError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| LookupError::MalformedInput("lookup API url has no path".into()))?
            .pop_if_empty()
            .push(email)
            .push(name);
        Ok(url)
    }
}

#[async_trait]
impl SourceAdapter for LookupApiAdapter {
    fn kind(&self) -> LookupKind {
        LookupKind::LinkedinSearch
    }

    fn name(&self) -> &str {
        "lookup-api"
    }

    async fn fetch(
        &self,
        input: &NormalizedInput,
        timeout: Duration,
    ) -> std::result::Result<RawResponse, LookupError> {
        let NormalizedInput::Person { email, name } = input else {
            return Err(LookupError::MalformedInput(format!(
                "lookup API needs a person, got {input:?}"
            )));
        };

        let url = self.endpoint(email, name)?;
        debug!(email = %mask_email(email), "calling lookup API");

        let response = self
            .client
            .get(url)
            .header(API_KEY_HEADER, &self.api_key)
            .header(reqwest::header::ACCEPT, "application/json")
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| send_error(e, timeout))?;

        let status = response.status();
        if !status.is_success() {
            return Err(status_error(status, "lookup API"));
        }

        let body: LookupBody = response
            .json()
            .await
            .map_err(|e| LookupError::InvalidResponse(format!("lookup API body: {e}")))?;

        let item = match body {
            LookupBody::List(items) => items.into_iter().next(),
            LookupBody::Single(item) => Some(item),
        }
        .ok_or_else(|| LookupError::NotFound("lookup API returned no results".into()))?;

        if !item.success {
            let reason = item.error_message.unwrap_or_else(|| "unknown error".into());
            return Err(LookupError::NotFound(reason));
        }
        let profile = item
            .linkedin_url
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| LookupError::NotFound("no profile url in result".into()))?;

        let mut fields = serde_json::Map::new();
        fields.insert("linkedin_url".into(), profile.clone().into());
        if let Some(method) = item.method_used {
            fields.insert("method_used".into(), method.into());
        }
        if let Some(ms) = item.processing_time_ms {
            fields.insert("processing_time_ms".into(), ms.into());
        }

        Ok(RawResponse {
            fields,
            discovered_url: Some(profile),
        })
    }
}
