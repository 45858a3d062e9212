use std::fmt;

use anyhow::{bail, Context, Result};
use reqwest::{Client, Response};
use serde::Deserialize;
use serde_json::json;
use tracing::debug;

use crate::dns01_client::Record;

use super::Dns01Api;

const CLOUDFLARE_API_URL: &str = "https://api.cloudflare.com/client/v4";
const CHALLENGE_TTL: u32 = 120;

#[derive(Clone)]
pub struct CloudflareClient {
    zone_id: String,
    api_token: String,
    api_url: String,
    client: Client,
}

impl fmt::Debug for CloudflareClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CloudflareClient")
            .field("zone_id", &self.zone_id)
            .field("api_url", &self.api_url)
            .finish_non_exhaustive()
    }
}

#[derive(Deserialize)]
struct Envelope<T> {
    result: T,
}

#[derive(Deserialize)]
struct ApiResult {
    id: String,
}

#[derive(Deserialize)]
struct Zone {
    name: String,
}

impl CloudflareClient {
    pub fn new(zone_id: String, api_token: String) -> Self {
        Self {
            zone_id,
            api_token,
            api_url: CLOUDFLARE_API_URL.into(),
            client: Client::new(),
        }
    }

    /// Point the client at another API endpoint.
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into().trim_end_matches('/').to_string();
        self
    }

    pub fn zone_id(&self) -> &str {
        &self.zone_id
    }

    /// Create a client for the zone that contains `domain`.
    ///
    /// Walks from the full name up to the registrable parent and returns the
    /// first zone the token can see.
    pub async fn discover(api_token: String, domain: &str) -> Result<Self> {
        let mut client = Self::new(String::new(), api_token);
        for candidate in zone_candidates(domain) {
            debug!("looking up cloudflare zone {candidate}");
            if let Some(zone_id) = client.find_zone(&candidate).await? {
                debug!("found cloudflare zone {candidate}: {zone_id}");
                client.zone_id = zone_id;
                return Ok(client);
            }
        }
        bail!("no cloudflare zone found for {domain}; check the domain and the token's Zone:Read permission")
    }

    /// Name of the zone this client writes records into.
    pub async fn zone_name(&self) -> Result<String> {
        let url = format!("{}/zones/{}", self.api_url, self.zone_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("failed to query cloudflare zone")?;
        let response = check_response(response, "failed to get zone").await?;
        let zone: Envelope<Zone> = response.json().await.context("failed to parse response")?;
        Ok(zone.result.name)
    }

    async fn find_zone(&self, name: &str) -> Result<Option<String>> {
        let url = format!("{}/zones", self.api_url);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_token)
            .query(&[("name", name)])
            .send()
            .await
            .context("failed to query cloudflare zones")?;
        let response = check_response(response, "failed to list zones").await?;
        let zones: Envelope<Vec<ApiResult>> =
            response.json().await.context("failed to parse response")?;
        Ok(zones.result.into_iter().next().map(|zone| zone.id))
    }

    fn dns_records_url(&self) -> String {
        format!("{}/zones/{}/dns_records", self.api_url, self.zone_id)
    }
}

impl Dns01Api for CloudflareClient {
    async fn add_txt_record(&self, domain: &str, content: &str) -> Result<String> {
        let response = self
            .client
            .post(self.dns_records_url())
            .bearer_auth(&self.api_token)
            .json(&json!({
                "type": "TXT",
                "name": domain,
                "content": content,
                "ttl": CHALLENGE_TTL
            }))
            .send()
            .await
            .context("failed to send request")?;
        let response = check_response(response, "failed to create acme challenge").await?;
        let response: Envelope<ApiResult> =
            response.json().await.context("failed to parse response")?;
        Ok(response.result.id)
    }

    async fn remove_record(&self, record_id: &str) -> Result<()> {
        let url = format!("{}/{record_id}", self.dns_records_url());
        let response = self
            .client
            .delete(&url)
            .bearer_auth(&self.api_token)
            .send()
            .await
            .context("failed to send request")?;
        check_response(response, "failed to remove dns record").await?;
        Ok(())
    }

    async fn get_records(&self, domain: &str) -> Result<Vec<Record>> {
        let response = self
            .client
            .get(self.dns_records_url())
            .bearer_auth(&self.api_token)
            .query(&[("name", domain), ("per_page", "100")])
            .send()
            .await
            .context("failed to send request")?;
        let response = check_response(response, "failed to get dns records").await?;
        let response: Envelope<Vec<Record>> =
            response.json().await.context("failed to parse response")?;
        let records = response
            .result
            .into_iter()
            .filter(|record| record.name == domain)
            .collect();
        Ok(records)
    }
}

async fn check_response(response: Response, what: &str) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    bail!("{what}: {status}: {}", format_api_error(&body))
}

/// Extract the error messages of a Cloudflare error response, falling back
/// to the raw body.
fn format_api_error(body: &str) -> String {
    #[derive(Deserialize)]
    struct ApiError {
        code: i64,
        message: String,
    }

    #[derive(Deserialize)]
    struct ErrorEnvelope {
        #[serde(default)]
        errors: Vec<ApiError>,
    }

    match serde_json::from_str::<ErrorEnvelope>(body) {
        Ok(envelope) if !envelope.errors.is_empty() => envelope
            .errors
            .iter()
            .map(|e| format!("[{}] {}", e.code, e.message))
            .collect::<Vec<_>>()
            .join("; "),
        _ => body.to_string(),
    }
}

/// Whether `domain` is the apex of `zone` or a name below it.
pub(crate) fn zone_covers(zone: &str, domain: &str) -> bool {
    let zone = zone.trim_end_matches('.').to_ascii_lowercase();
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    let domain = domain.trim_end_matches('.').to_ascii_lowercase();
    domain == zone
        || domain
            .strip_suffix(&zone)
            .is_some_and(|prefix| prefix.ends_with('.'))
}

/// Names that may be the zone apex of `domain`, longest first.
fn zone_candidates(domain: &str) -> Vec<String> {
    let domain = domain.strip_prefix("*.").unwrap_or(domain);
    let domain = domain.trim_end_matches('.');
    let labels: Vec<&str> = domain.split('.').collect();
    if labels.len() < 2 {
        return vec![domain.to_string()];
    }
    (0..=labels.len() - 2)
        .map(|i| labels[i..].join("."))
        .collect()
}
