//! REST CRM adapter

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, IF_MATCH, RETRY_AFTER};
use reqwest::{RequestBuilder, Response, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::CrmSettings;
use crate::error::{Error, Result};
use crate::models::{EventId, OwnerId, Payload, RecordKind, RemotePage, RemoteRecord, SyncCursor};
use crate::util::compact_text;

use super::{CrmAdapter, CrmError, CrmResult};

const IDEMPOTENCY_KEY: &str = "Idempotency-Key";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(1);

/// CRM adapter speaking JSON over HTTP
#[derive(Clone)]
pub struct HttpCrmAdapter {
    base_url: Url,
    api_token: String,
    client: reqwest::Client,
}

impl std::fmt::Debug for HttpCrmAdapter {
    fn fmt(&self, formatter: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        formatter
            .debug_struct("HttpCrmAdapter")
            .field("base_url", &self.base_url.as_str())
            .field("api_token", &"[REDACTED]")
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct WriteBody<'a> {
    payload: &'a Payload,
    #[serde(skip_serializing_if = "Option::is_none")]
    expected_remote_version: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct CrmErrorBody {
    error: Option<String>,
    message: Option<String>,
}

impl HttpCrmAdapter {
    pub fn new(settings: &CrmSettings) -> Result<Self> {
        let base_url = Url::parse(&settings.base_url)
            .map_err(|error| Error::InvalidInput(format!("Invalid CRM base URL: {error}")))?;
        if base_url.cannot_be_a_base() {
            return Err(Error::InvalidInput(format!(
                "CRM base URL cannot carry paths: {base_url}"
            )));
        }
        let client = reqwest::Client::builder()
            .timeout(settings.request_timeout)
            .build()
            .map_err(|error| Error::InvalidInput(format!("HTTP client setup failed: {error}")))?;

        Ok(Self {
            base_url,
            api_token: settings.api_token.clone(),
            client,
        })
    }

    fn records_url(&self, owner: &OwnerId, kind: RecordKind, remote_id: Option<&str>) -> Url {
        let mut url = self.base_url.clone();
        if let Ok(mut segments) = url.path_segments_mut() {
            segments
                .pop_if_empty()
                .extend(["owners", owner.as_str(), "records", kind.as_str()]);
            if let Some(remote_id) = remote_id {
                segments.push(remote_id);
            }
        }
        url
    }

    async fn send(&self, request: RequestBuilder) -> CrmResult<Response> {
        let response = request
            .bearer_auth(&self.api_token)
            .header(ACCEPT, "application/json")
            .send()
            .await
            .map_err(|error| transport_error(&error))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|value| value.to_str().ok())
            .map(str::to_owned);
        let body = response.text().await.unwrap_or_default();
        Err(classify_status(status, retry_after.as_deref(), &body))
    }
}

#[async_trait]
impl CrmAdapter for HttpCrmAdapter {
    async fn create(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        payload: &Payload,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord> {
        let url = self.records_url(owner, kind, None);
        tracing::debug!(%owner, %kind, key = %idempotency_key, "POST {url}");

        let request = self
            .client
            .post(url)
            .header(IDEMPOTENCY_KEY, idempotency_key.as_str())
            .json(&WriteBody {
                payload,
                expected_remote_version: None,
            });
        decode(self.send(request).await?).await
    }

    async fn update(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
        payload: &Payload,
        expected_remote_version: Option<i64>,
        idempotency_key: EventId,
    ) -> CrmResult<RemoteRecord> {
        let url = self.records_url(owner, kind, Some(remote_id));
        tracing::debug!(%owner, %kind, key = %idempotency_key, "PATCH {url}");

        let mut request = self
            .client
            .patch(url)
            .header(IDEMPOTENCY_KEY, idempotency_key.as_str())
            .json(&WriteBody {
                payload,
                expected_remote_version,
            });
        if let Some(version) = expected_remote_version {
            request = request.header(IF_MATCH, format!("\"{version}\""));
        }
        decode(self.send(request).await?).await
    }

    async fn fetch_changed_since(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        cursor: Option<&SyncCursor>,
    ) -> CrmResult<RemotePage> {
        let url = self.records_url(owner, kind, None);
        tracing::debug!(%owner, %kind, cursor = ?cursor.map(SyncCursor::as_str), "GET {url}");

        let mut request = self.client.get(url);
        if let Some(cursor) = cursor {
            request = request.query(&[("since", cursor.as_str())]);
        }
        decode(self.send(request).await?).await
    }

    async fn fetch_record(
        &self,
        owner: &OwnerId,
        kind: RecordKind,
        remote_id: &str,
    ) -> CrmResult<Option<RemoteRecord>> {
        let url = self.records_url(owner, kind, Some(remote_id));
        tracing::debug!(%owner, %kind, "GET {url}");

        match self.send(self.client.get(url)).await {
            Ok(response) => decode(response).await.map(Some),
            Err(CrmError::NotFound) => Ok(None),
            Err(error) => Err(error),
        }
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> CrmResult<T> {
    response.json::<T>().await.map_err(|error| {
        if error.is_decode() {
            CrmError::Fatal(format!("Undecodable CRM response: {}", sanitize(&error)))
        } else {
            transport_error(&error)
        }
    })
}

fn transport_error(error: &reqwest::Error) -> CrmError {
    if error.is_builder() {
        CrmError::Fatal(format!("Invalid CRM request: {}", sanitize(error)))
    } else {
        CrmError::Transient(format!("CRM request failed: {}", sanitize(error)))
    }
}

/// Map a non-success HTTP status to the CRM error taxonomy
fn classify_status(status: StatusCode, retry_after: Option<&str>, body: &str) -> CrmError {
    match status {
        StatusCode::TOO_MANY_REQUESTS => CrmError::RateLimited {
            retry_after: parse_retry_after(retry_after),
        },
        StatusCode::CONFLICT | StatusCode::PRECONDITION_FAILED => {
            CrmError::Conflict(parse_api_error(status, body))
        }
        StatusCode::NOT_FOUND => CrmError::NotFound,
        StatusCode::REQUEST_TIMEOUT => CrmError::Transient(parse_api_error(status, body)),
        status if status.is_server_error() => CrmError::Transient(parse_api_error(status, body)),
        status => CrmError::Fatal(parse_api_error(status, body)),
    }
}

fn parse_retry_after(value: Option<&str>) -> Duration {
    value
        .and_then(|value| value.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}

fn parse_api_error(status: StatusCode, body: &str) -> String {
    if let Ok(payload) = serde_json::from_str::<CrmErrorBody>(body) {
        if let Some(message) = payload.message.or(payload.error) {
            return format!("{} ({})", compact_text(&message), status.as_u16());
        }
    }

    let trimmed = compact_text(body);
    if trimmed.is_empty() {
        format!("HTTP {}", status.as_u16())
    } else {
        format!("{} ({})", trimmed, status.as_u16())
    }
}

fn sanitize(error: &impl std::fmt::Display) -> String {
    error.to_string().replace('\n', " ").trim().to_string()
}
