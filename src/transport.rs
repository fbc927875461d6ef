//! Rate-limited, retrying HTTP transport for the external API.
//!
//! Every response's quota headers are trusted on their own; there is no
//! shared limiter across calls. Backoff sleeps suspend only the calling task.

use crate::config::TransportConfig;
use crate::error::{Error, Result};
use crate::telemetry::metrics;
use async_trait::async_trait;
use opentelemetry::KeyValue;
use opentelemetry_semantic_conventions::attribute::{HTTP_RESPONSE_STATUS_CODE, SERVER_ADDRESS};
use rand::Rng;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Status codes the upstream uses to signal an exceeded rate limit.
const RATE_LIMITED: [u16; 2] = [420, 429];

/// Longest quota window honoured from a response header. Larger values
/// are clamped to it.
const MAX_RESET_SECS: i64 = 3600;

/// An outbound GET request.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub url: String,
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
}

impl ApiRequest {
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            query: Vec::new(),
            headers: HeaderMap::new(),
        }
    }

    pub fn query(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.query.push((key.into(), value.to_string()));
        self
    }

    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    fn host(&self) -> String {
        reqwest::Url::parse(&self.url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string))
            .unwrap_or_default()
    }
}

/// A fully-read response.
#[derive(Debug, Clone)]
pub struct ApiResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

impl ApiResponse {
    pub fn header_str(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// A request that never produced a response (status 0).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

/// The inner transport: performs exactly one request.
#[async_trait]
pub trait HttpSend: Send + Sync {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError>;
}

/// `HttpSend` over a pooled reqwest client.
pub struct ReqwestSender {
    client: reqwest::Client,
}

impl ReqwestSender {
    pub fn new(config: &TransportConfig, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .timeout(config.timeout())
            .connect_timeout(config.connect_timeout())
            .pool_max_idle_per_host(config.pool_max_idle_per_host)
            .build()
            .map_err(|e| Error::Config(format!("failed to build http client: {e}")))?;
        Ok(Self { client })
    }
}

#[async_trait]
impl HttpSend for ReqwestSender {
    async fn send(&self, request: &ApiRequest) -> std::result::Result<ApiResponse, TransportError> {
        let response = self
            .client
            .get(&request.url)
            .query(&request.query)
            .headers(request.headers.clone())
            .send()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response
            .bytes()
            .await
            .map_err(|e| TransportError(e.to_string()))?;

        Ok(ApiResponse {
            status,
            headers,
            body: body.to_vec(),
        })
    }
}

/// Quota metadata read from a response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimit {
    pub remaining: i64,
    pub reset_secs: i64,
}

impl RateLimit {
    /// Both headers must parse as integers, otherwise the response is
    /// treated as coming from a source without quota metadata.
    pub fn from_headers(headers: &HeaderMap, remaining_header: &str, reset_header: &str) -> Option<Self> {
        let parse = |name: &str| -> Option<i64> {
            headers.get(name)?.to_str().ok()?.trim().parse().ok()
        };
        Some(Self {
            remaining: parse(remaining_header)?,
            reset_secs: parse(reset_header)?,
        })
    }

    /// Seconds until the quota window resets, clamped to `0..=MAX_RESET_SECS`.
    pub fn reset_window(&self) -> u64 {
        self.reset_secs.clamp(0, MAX_RESET_SECS) as u64
    }

    /// Cooperative pacing: `reset * 2 * (1 - remaining/100)` whole seconds.
    pub fn pacing_delay(&self) -> Duration {
        let spent = 1.0 - self.remaining.clamp(0, 100) as f64 / 100.0;
        let secs = (self.reset_window() * 2) as f64 * spent;
        if secs.is_finite() && secs >= 1.0 {
            Duration::from_secs(secs as u64)
        } else {
            Duration::ZERO
        }
    }
}

/// Wraps an [`HttpSend`] with pacing and bounded retries.
pub struct RateLimitedTransport {
    inner: Arc<dyn HttpSend>,
    config: TransportConfig,
}

impl RateLimitedTransport {
    pub fn new(inner: Arc<dyn HttpSend>, config: TransportConfig) -> Self {
        Self { inner, config }
    }

    /// Perform one logical request.
    ///
    /// Rate-limited, 5xx and connection failures are retried until
    /// `max_attempts` is reached, after which the last response or error is
    /// returned. Any other status comes back on the first attempt.
    pub async fn execute(
        &self,
        request: &ApiRequest,
    ) -> std::result::Result<ApiResponse, TransportError> {
        let max_attempts = self.config.max_attempts.max(1);
        let host = request.host();
        let mut tries: u32 = 0;

        loop {
            tries += 1;
            let start = Instant::now();
            let outcome = self.inner.send(request).await;
            metrics::api_call_duration_ms().record(
                start.elapsed().as_secs_f64() * 1000.0,
                &[KeyValue::new(SERVER_ADDRESS, host.clone())],
            );

            let response = match outcome {
                Ok(response) => response,
                Err(e) => {
                    metrics::api_errors().add(1, &[KeyValue::new(HTTP_RESPONSE_STATUS_CODE, 0_i64)]);
                    warn!(url = %request.url, tries, error = %e, "api request failed");
                    if tries >= max_attempts {
                        return Err(e);
                    }
                    self.retry_pause("connection", Duration::from_secs(u64::from(tries)))
                        .await;
                    continue;
                }
            };

            let status = response.status;
            let limit = RateLimit::from_headers(
                &response.headers,
                &self.config.remaining_header,
                &self.config.reset_header,
            );

            if status >= 300 {
                metrics::api_errors()
                    .add(1, &[KeyValue::new(HTTP_RESPONSE_STATUS_CODE, i64::from(status))]);
                warn!(
                    status,
                    reset = response.header_str(&self.config.reset_header).unwrap_or("-"),
                    remaining = response.header_str(&self.config.remaining_header).unwrap_or("-"),
                    url = %request.url,
                    "api error response"
                );
            }

            if let Some(limit) = limit {
                let pause = limit.pacing_delay();
                if !pause.is_zero() {
                    debug!(?pause, remaining = limit.remaining, "pacing against quota");
                    tokio::time::sleep(pause).await;
                }
            }

            if RATE_LIMITED.contains(&status) {
                let reset = limit.map(|l| l.reset_window()).unwrap_or(0);
                let jitter = if self.config.jitter_secs > 0 {
                    rand::thread_rng().gen_range(0..self.config.jitter_secs)
                } else {
                    0
                };
                tokio::time::sleep(Duration::from_secs(reset.saturating_add(jitter))).await;
            }

            let retryable = RATE_LIMITED.contains(&status) || status >= 500;
            if !retryable {
                return Ok(response);
            }
            if tries >= max_attempts {
                warn!(status, tries, url = %request.url, "giving up after retries");
                return Ok(response);
            }
            // Without quota metadata there was no pacing sleep; back off linearly.
            let pause = if limit.is_none() {
                Duration::from_secs(u64::from(tries))
            } else {
                Duration::ZERO
            };
            let reason = if RATE_LIMITED.contains(&status) {
                "rate_limited"
            } else {
                "server_error"
            };
            self.retry_pause(reason, pause).await;
        }
    }

    async fn retry_pause(&self, reason: &'static str, pause: Duration) {
        metrics::api_retries().add(1, &[KeyValue::new("reason", reason)]);
        if !pause.is_zero() {
            tokio::time::sleep(pause).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(remaining: &str, reset: &str) -> HeaderMap {
        let mut map = HeaderMap::new();
        map.insert("x-esi-error-limit-remain", HeaderValue::from_str(remaining).unwrap());
        map.insert("x-esi-error-limit-reset", HeaderValue::from_str(reset).unwrap());
        map
    }

    fn parse(map: &HeaderMap) -> Option<RateLimit> {
        RateLimit::from_headers(map, "x-esi-error-limit-remain", "x-esi-error-limit-reset")
    }

    #[test]
    fn parses_integer_headers_only() {
        assert_eq!(
            parse(&headers("100", "42")),
            Some(RateLimit {
                remaining: 100,
                reset_secs: 42
            })
        );
        assert_eq!(parse(&headers("lots", "42")), None);
        assert_eq!(parse(&HeaderMap::new()), None);
    }

    #[test]
    fn pacing_scales_with_spent_quota() {
        let exhausted = RateLimit {
            remaining: 0,
            reset_secs: 60,
        };
        assert_eq!(exhausted.pacing_delay(), Duration::from_secs(120));

        let half = RateLimit {
            remaining: 50,
            reset_secs: 60,
        };
        assert_eq!(half.pacing_delay(), Duration::from_secs(60));

        let full = RateLimit {
            remaining: 100,
            reset_secs: 60,
        };
        assert_eq!(full.pacing_delay(), Duration::ZERO);
    }

    #[test]
    fn hostile_quota_headers_are_clamped() {
        let huge = RateLimit {
            remaining: 0,
            reset_secs: i64::MAX,
        };
        assert_eq!(huge.reset_window(), 3600);
        assert_eq!(huge.pacing_delay(), Duration::from_secs(7200));

        let negative = RateLimit {
            remaining: -50,
            reset_secs: -10,
        };
        assert_eq!(negative.reset_window(), 0);
        assert_eq!(negative.pacing_delay(), Duration::ZERO);

        let overfull = RateLimit {
            remaining: i64::MAX,
            reset_secs: 60,
        };
        assert_eq!(overfull.pacing_delay(), Duration::ZERO);
    }

    #[test]
    fn request_host_is_extracted_from_url() {
        let req = ApiRequest::get("https://esi.evetech.net/latest/characters/1/");
        assert_eq!(req.host(), "esi.evetech.net");
    }
}
