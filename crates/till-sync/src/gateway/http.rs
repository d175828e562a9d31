//! JSON-over-HTTP gateway for the sync API.

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use super::{PullBatch, RemoteGateway};
use crate::config::GatewayConfig;
use crate::error::{Error, Result};
use crate::models::{Operation, OutboxEntry, PushOutcome, RemoteChange};
use crate::util::compact_text;

const CHANGES_PATH: &str = "/v1/sync/changes";
const PUSH_PATH: &str = "/v1/sync/push";

/// Talks to the sync API over HTTPS with bearer auth
#[derive(Clone)]
pub struct HttpGateway {
    base_url: String,
    auth_token: Option<String>,
    device_id: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpGateway {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpGateway")
            .field("base_url", &self.base_url)
            .field(
                "auth_token",
                &self.auth_token.as_ref().map(|_| "[REDACTED]"),
            )
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

impl HttpGateway {
    pub fn new(config: &GatewayConfig, device_id: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.request_timeout)
            .build()?;

        Ok(Self {
            base_url: config.base_url.trim_end_matches('/').to_string(),
            auth_token: config.auth_token.clone(),
            device_id: device_id.into(),
            client,
        })
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.auth_token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn read_json<T: for<'de> Deserialize<'de>>(response: reqwest::Response) -> Result<T> {
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Error::transport(parse_api_error(status, &body)));
        }

        let body = response.text().await?;
        serde_json::from_str(&body).map_err(|error| {
            Error::transport(format!("invalid response body: {error}"))
        })
    }
}

#[async_trait]
impl RemoteGateway for HttpGateway {
    async fn pull(&self, since_cursor: Option<&str>) -> Result<PullBatch> {
        let mut request = self
            .client
            .get(format!("{}{CHANGES_PATH}", self.base_url))
            .header("Accept", "application/json");
        if let Some(cursor) = since_cursor {
            request = request.query(&[("cursor", cursor)]);
        }

        let response = self.authorize(request).send().await?;
        let page: ChangesResponse = Self::read_json(response).await?;
        Ok(page.into_batch())
    }

    async fn push(&self, batch: &[OutboxEntry]) -> Result<Vec<PushOutcome>> {
        if batch.is_empty() {
            return Ok(Vec::new());
        }

        let body = PushRequest {
            device_id: &self.device_id,
            mutations: batch.iter().map(PushMutation::from).collect(),
        };
        let request = self
            .client
            .post(format!("{}{PUSH_PATH}", self.base_url))
            .header("Accept", "application/json")
            .json(&body);

        let response = self.authorize(request).send().await?;
        let payload: PushResponse = Self::read_json(response).await?;
        Ok(payload.results)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChangesResponse {
    #[serde(default)]
    records: Vec<Value>,
    #[serde(default)]
    next_cursor: Option<String>,
    #[serde(default)]
    has_more: bool,
}

impl ChangesResponse {
    /// Decode records one at a time so a bad record only drops itself.
    fn into_batch(self) -> PullBatch {
        let mut changes = Vec::with_capacity(self.records.len());
        let mut skipped = 0;

        for raw in self.records {
            match serde_json::from_value::<RemoteChange>(raw.clone()) {
                Ok(change) => changes.push(change),
                Err(error) => {
                    skipped += 1;
                    tracing::warn!(
                        record = %compact_text(&raw.to_string()),
                        "Skipping malformed server record: {error}"
                    );
                }
            }
        }

        PullBatch {
            changes,
            next_cursor: self.next_cursor,
            has_more: self.has_more,
            skipped,
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushRequest<'a> {
    device_id: &'a str,
    mutations: Vec<PushMutation<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct PushMutation<'a> {
    mutation_id: Uuid,
    table: &'a str,
    id: &'a str,
    operation: Operation,
    payload: &'a Value,
    based_on_server_updated_at: Option<i64>,
}

impl<'a> From<&'a OutboxEntry> for PushMutation<'a> {
    fn from(entry: &'a OutboxEntry) -> Self {
        Self {
            mutation_id: entry.mutation_id,
            table: &entry.table,
            id: &entry.id,
            operation: entry.operation,
            payload: &entry.payload_snapshot,
            based_on_server_updated_at: entry.based_on_server_updated_at,
        }
    }
}

#[derive(Debug, Deserialize)]
struct PushResponse {
    #[serde(default)]
    results: Vec<PushOutcome>,
}

#[derive(Debug, Deserialize)]
struct ApiErrorBody {
    error: Option<String>,
    message: Option<String>,
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<ApiErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", message.trim(), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}
