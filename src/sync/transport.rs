use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION, CONTENT_TYPE};
use reqwest::Client;

use super::error::TransmissionError;
use super::payload::SyncPayload;

/// Delivers one batch to the collector. A returned `Ok` means the collector
/// confirmed receipt and the batch may be committed.
#[async_trait]
pub trait SessionTransport: Send + Sync {
    async fn send(
        &self,
        payload: &SyncPayload,
        headers: &[(String, String)],
    ) -> Result<(), TransmissionError>;
}

/// JSON-over-HTTP transport. When an API key is configured it is sent as a
/// bearer token and replaces any `Authorization` header from the credentials.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: Client,
    endpoint: String,
    api_key: Option<String>,
    timeout: Duration,
}

impl HttpTransport {
    pub fn new(endpoint: impl Into<String>, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key: api_key.filter(|key| !key.trim().is_empty()),
            timeout,
        })
    }

    fn request_headers(
        &self,
        extra: &[(String, String)],
    ) -> Result<HeaderMap, TransmissionError> {
        let mut headers = HeaderMap::new();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

        for (name, value) in extra {
            let header_name =
                HeaderName::from_bytes(name.as_bytes()).map_err(|err| invalid_header(name, err))?;
            let header_value = HeaderValue::from_str(value).map_err(|err| invalid_header(name, err))?;
            headers.insert(header_name, header_value);
        }

        if let Some(key) = &self.api_key {
            let bearer = HeaderValue::from_str(&format!("Bearer {key}"))
                .map_err(|err| invalid_header(AUTHORIZATION.as_str(), err))?;
            headers.insert(AUTHORIZATION, bearer);
        }

        Ok(headers)
    }

    fn classify(&self, err: reqwest::Error) -> TransmissionError {
        if err.is_timeout() {
            TransmissionError::Timeout(self.timeout)
        } else {
            TransmissionError::Request(err)
        }
    }
}

fn invalid_header(name: &str, err: impl std::fmt::Display) -> TransmissionError {
    TransmissionError::InvalidHeader {
        name: name.to_string(),
        reason: err.to_string(),
    }
}

#[async_trait]
impl SessionTransport for HttpTransport {
    async fn send(
        &self,
        payload: &SyncPayload,
        headers: &[(String, String)],
    ) -> Result<(), TransmissionError> {
        let headers = self.request_headers(headers)?;

        let response = self
            .client
            .post(&self.endpoint)
            .headers(headers)
            .json(payload)
            .send()
            .await
            .map_err(|err| self.classify(err))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TransmissionError::Status(status.as_u16()));
        }

        Ok(())
    }
}
