use std::time;

use async_trait::async_trait;
use chrono::SecondsFormat;
use reqwest::header;
use tracing::debug;
use url::Url;

use crate::store::{DeleteRequest, Point, StoreError, TimeSeriesStore};

/// An InfluxDB v2 client over its HTTP API. The inner `reqwest::Client` keeps
/// one connection pool that every executor worker shares.
#[derive(Clone)]
pub struct InfluxStore {
    client: reqwest::Client,
    write_url: Url,
    delete_url: Url,
}

impl InfluxStore {
    pub fn new(
        base_url: &str,
        token: &str,
        org: &str,
        bucket: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, StoreError> {
        let mut auth = header::HeaderValue::from_str(&format!("Token {}", token))
            .map_err(|_| StoreError::InvalidToken)?;
        auth.set_sensitive(true);

        let mut headers = header::HeaderMap::new();
        headers.insert(header::AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("telemetry-worker")
            .timeout(request_timeout)
            .build()?;

        // Without a trailing slash, join() would replace the last path segment.
        let base = if base_url.ends_with('/') {
            Url::parse(base_url)?
        } else {
            Url::parse(&format!("{}/", base_url))?
        };

        let mut write_url = base.join("api/v2/write")?;
        write_url
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket)
            .append_pair("precision", "ms");

        let mut delete_url = base.join("api/v2/delete")?;
        delete_url
            .query_pairs_mut()
            .append_pair("org", org)
            .append_pair("bucket", bucket);

        Ok(Self {
            client,
            write_url,
            delete_url,
        })
    }
}

async fn check_response(response: reqwest::Response) -> Result<(), StoreError> {
    let status = response.status();
    if status.is_success() {
        return Ok(());
    }

    let body = response.text().await.unwrap_or_default();
    Err(StoreError::ResponseError { status, body })
}

#[async_trait]
impl TimeSeriesStore for InfluxStore {
    async fn write(&self, point: &Point) -> Result<(), StoreError> {
        let response = self
            .client
            .post(self.write_url.clone())
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .body(point.to_line_protocol())
            .send()
            .await?;

        check_response(response).await
    }

    async fn delete(&self, request: &DeleteRequest) -> Result<(), StoreError> {
        let body = serde_json::json!({
            "start": request.start.to_rfc3339_opts(SecondsFormat::Secs, true),
            "stop": request.stop.to_rfc3339_opts(SecondsFormat::Secs, true),
            "predicate": request.predicate,
        });
        debug!(predicate = request.predicate, "deleting from time-series store");

        let response = self
            .client
            .post(self.delete_url.clone())
            .json(&body)
            .send()
            .await?;

        check_response(response).await
    }
}
