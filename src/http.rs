//! `reqwest` client for a Discord-style REST API.
//!
//! `POST {base}/channels/{resource}/messages` with the payload as JSON.
//! Rate-limit metadata comes from the `X-RateLimit-*` headers; a 429 body
//! may carry `retry_after` (seconds) and `global`.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::HeaderMap;
use serde::Deserialize;
use tracing::debug;

use crate::rate_limit::RateLimitUpdate;
use crate::remote::{RemoteApi, RemoteResponse, RemoteStatus};
use crate::types::{Payload, ResourceId};

pub const DEFAULT_BASE_URL: &str = "https://discord.com/api/v10";

#[derive(Debug, Clone)]
pub struct HttpApi {
    client: reqwest::Client,
    base_url: String,
    authorization: String,
}

#[derive(Debug, Default, Deserialize)]
struct RateLimitBody {
    retry_after: Option<f64>,
    #[serde(default)]
    global: bool,
}

impl HttpApi {
    /// Client authenticating as a bot with `token`.
    pub fn new(token: &str) -> Self {
        Self::with_client(reqwest::Client::new(), DEFAULT_BASE_URL, format!("Bot {}", token))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: impl Into<String>,
        authorization: impl Into<String>,
    ) -> Self {
        Self {
            client,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            authorization: authorization.into(),
        }
    }

    fn message_url(&self, resource: &ResourceId) -> String {
        format!("{}/channels/{}/messages", self.base_url, resource)
    }
}

#[async_trait]
impl RemoteApi for HttpApi {
    async fn call(&self, resource: &ResourceId, payload: &Payload) -> RemoteResponse {
        let request = self
            .client
            .post(self.message_url(resource))
            .header("Authorization", &self.authorization)
            .json(payload);

        let response = match request.send().await {
            Ok(response) => response,
            Err(err) => {
                let detail = if err.is_timeout() { "timed out".to_string() } else { err.to_string() };
                return RemoteResponse::new(RemoteStatus::Network(detail));
            }
        };

        let code = response.status().as_u16();
        let headers = response.headers().clone();
        let body = if code == 429 {
            response.json::<RateLimitBody>().await.unwrap_or_default()
        } else {
            RateLimitBody::default()
        };

        debug!(resource = %resource, status = code, "remote responded");
        response_from_parts(code, &headers, body)
    }
}

/// Fold status, headers and the (429-only) body into a [`RemoteResponse`].
///
/// The body's `retry_after` wins over the `Retry-After` header; either the
/// body or `X-RateLimit-Global` can mark a limit as global.
fn response_from_parts(code: u16, headers: &HeaderMap, body: RateLimitBody) -> RemoteResponse {
    let global = body.global
        || header_str(headers, "x-ratelimit-global").is_some_and(|v| v.eq_ignore_ascii_case("true"));
    let retry_after = body
        .retry_after
        .and_then(seconds)
        .or_else(|| header_seconds(headers, "retry-after"));

    RemoteResponse {
        status: status_for(code, global),
        retry_after,
        rate_limit: rate_limit_from_headers(headers),
    }
}

pub(crate) fn status_for(code: u16, global: bool) -> RemoteStatus {
    match code {
        200..=299 => RemoteStatus::Success,
        401 => RemoteStatus::Unauthorized,
        403 => RemoteStatus::Forbidden,
        404 => RemoteStatus::NotFound,
        429 => RemoteStatus::RateLimited { global },
        400..=499 => RemoteStatus::ClientError(code),
        500..=599 => RemoteStatus::ServerError(code),
        // 1xx and 3xx are never valid answers to a message post; retrying won't help
        _ => RemoteStatus::ClientError(code),
    }
}

pub(crate) fn rate_limit_from_headers(headers: &HeaderMap) -> Option<RateLimitUpdate> {
    let remaining = header_str(headers, "x-ratelimit-remaining")?.parse::<u32>().ok()?;
    let reset_after = header_seconds(headers, "x-ratelimit-reset-after")?;
    let limit = header_str(headers, "x-ratelimit-limit").and_then(|v| v.parse::<u32>().ok());
    Some(RateLimitUpdate { limit, remaining, reset_after })
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name)?.to_str().ok()
}

fn header_seconds(headers: &HeaderMap, name: &str) -> Option<Duration> {
    header_str(headers, name)?.parse::<f64>().ok().and_then(seconds)
}

fn seconds(value: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(value).ok()
}
