use std::time::{Duration, Instant};

use reqwest::{header::HeaderMap, Method, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};
use tokio::time::sleep;

use crate::{
    errors::{APIError, RequestError, RetryMetadata, TransportError, TransportErrorKind},
    telemetry::{HttpRequestMetrics, RequestContext, Telemetry},
    REQUEST_ID_HEADER,
};

/// Retry/backoff configuration (defaults use 3 attempts + jittered exponential backoff).
///
/// Only unary calls are retried. Thread deletion and streaming runs always go out once.
#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_backoff: Duration,
    pub max_backoff: Duration,
    /// Retry non-idempotent POSTs (thread/message creation). Off by default so a
    /// flaky network cannot open two threads for one invocation.
    pub retry_post: bool,
}

impl RetryConfig {
    pub fn disabled() -> Self {
        Self {
            max_attempts: 1,
            ..Default::default()
        }
    }

    /// 408, 429 and 5xx are transient; everything else is final.
    pub fn should_retry_status(&self, method: &Method, status: StatusCode) -> bool {
        let transient = status.is_server_error()
            || matches!(
                status,
                StatusCode::TOO_MANY_REQUESTS | StatusCode::REQUEST_TIMEOUT
            );
        transient && self.permits(method)
    }

    /// Timeouts and connection failures are transient.
    pub fn should_retry_error(&self, method: &Method, err: &reqwest::Error) -> bool {
        (err.is_timeout() || err.is_connect() || err.is_request()) && self.permits(method)
    }

    /// Jittered exponential backoff before retry number `attempt` (1-indexed).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        let doublings = attempt.saturating_sub(1).min(10);
        let ceiling = self
            .base_backoff
            .saturating_mul(1u32 << doublings)
            .min(self.max_backoff);
        let jittered = ceiling.as_secs_f64() * (0.5 + fastrand::f64());
        Duration::from_secs_f64(jittered.min(self.max_backoff.as_secs_f64()))
    }

    /// Same policy with POST retries enabled, for idempotent POST endpoints.
    pub(crate) fn allowing_post(&self) -> Self {
        Self {
            retry_post: true,
            ..self.clone()
        }
    }

    fn permits(&self, method: &Method) -> bool {
        *method != Method::POST || self.retry_post
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(300),
            max_backoff: Duration::from_secs(5),
            retry_post: false,
        }
    }
}

pub(crate) fn request_id_from_headers(headers: &HeaderMap) -> Option<String> {
    [REQUEST_ID_HEADER, "x-request-id"]
        .into_iter()
        .filter_map(|name| headers.get(name))
        .filter_map(|value| value.to_str().ok())
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

/// Failure body of the open API. Older gateways spell the request id differently.
#[derive(Deserialize)]
struct ErrorEnvelope {
    code: Option<String>,
    message: Option<String>,
    #[serde(alias = "requestId", alias = "request_id")]
    requestid: Option<String>,
}

/// Turn a non-success response into an [`APIError`].
///
/// Bodies that are not the `{code, message, requestid}` envelope are kept verbatim as the
/// message; an empty body falls back to the canonical status text.
pub(crate) fn parse_api_error_parts(
    status: StatusCode,
    headers: &HeaderMap,
    body: String,
    retries: Option<RetryMetadata>,
) -> APIError {
    let status_text = status.canonical_reason().unwrap_or("request failed");
    let mut err = APIError::new(status.as_u16(), status_text);
    err.request_id = request_id_from_headers(headers);
    err.retries = retries;

    if body.trim().is_empty() {
        return err;
    }

    match serde_json::from_str::<ErrorEnvelope>(&body) {
        Ok(envelope) if envelope.code.is_some() || envelope.message.is_some() => {
            err.code = envelope.code;
            if let Some(message) = envelope.message {
                err.message = message;
            }
            err.request_id = envelope.requestid.or(err.request_id);
        }
        _ => err.message = body.clone(),
    }
    err.raw_body = Some(body);
    err
}

/// Send a request, retrying per `retry`, and report the outcome to telemetry.
///
/// Non-success responses are turned into [`APIError`]s once retries are exhausted.
pub(crate) async fn send_with_retry(
    builder: reqwest::RequestBuilder,
    method: Method,
    retry: &RetryConfig,
    telemetry: &Telemetry,
    ctx: RequestContext,
) -> Result<reqwest::Response, RequestError> {
    let max_attempts = retry.max_attempts.max(1);
    let mut state = RetryState::default();
    let start = Instant::now();
    let report = |status: Option<u16>, error: Option<String>, retries, request_id| {
        if telemetry.http_enabled() {
            telemetry.record_http(HttpRequestMetrics {
                latency: start.elapsed(),
                status,
                error,
                retries,
                context: ctx.clone().with_request_id(request_id),
            });
        }
    };

    let mut attempt = 0;
    loop {
        attempt += 1;
        let Some(attempt_builder) = builder.try_clone() else {
            return Err(TransportError {
                kind: TransportErrorKind::Request,
                message: "request body is not cloneable".to_string(),
                source: None,
                retries: None,
            }
            .into());
        };

        #[cfg(feature = "tracing")]
        let result = {
            use tracing::Instrument;
            let span = tracing::debug_span!(
                "dingtalk.http",
                method = %ctx.method,
                path = %ctx.path,
                attempt,
                max_attempts
            );
            attempt_builder.send().instrument(span).await
        };
        #[cfg(not(feature = "tracing"))]
        let result = attempt_builder.send().await;

        state.attempts = attempt;
        let retryable = attempt < max_attempts;
        match result {
            Ok(resp) if resp.status().is_success() => {
                let status = resp.status();
                report(
                    Some(status.as_u16()),
                    None,
                    state.metadata(),
                    request_id_from_headers(resp.headers()),
                );
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    status = %status,
                    elapsed_ms = start.elapsed().as_millis() as u64,
                    "request completed"
                );
                return Ok(resp);
            }
            Ok(resp) => {
                let status = resp.status();
                state.last_status = Some(status.as_u16());
                if retryable && retry.should_retry_status(&method, status) {
                    sleep(retry.backoff_delay(attempt)).await;
                    continue;
                }

                let headers = resp.headers().clone();
                report(
                    Some(status.as_u16()),
                    Some(format!("http {}", status.as_u16())),
                    state.metadata(),
                    request_id_from_headers(&headers),
                );
                #[cfg(feature = "tracing")]
                tracing::warn!(status = %status, attempt, "request failed");
                let body = resp.text().await.unwrap_or_default();
                return Err(parse_api_error_parts(status, &headers, body, state.metadata()).into());
            }
            Err(err) => {
                state.last_error = Some(err.to_string());
                if retryable && retry.should_retry_error(&method, &err) {
                    sleep(retry.backoff_delay(attempt)).await;
                    continue;
                }

                report(None, Some(err.to_string()), state.metadata(), None);
                #[cfg(feature = "tracing")]
                tracing::warn!(attempt, error = %err, "transport error");
                return Err(TransportError::from_reqwest(err, state.metadata()).into());
            }
        }
    }
}

/// Read a success body as JSON.
pub(crate) async fn read_json<T: DeserializeOwned>(
    resp: reqwest::Response,
) -> Result<T, RequestError> {
    let bytes = resp
        .bytes()
        .await
        .map_err(|err| TransportError::from_reqwest(err, None))?;
    Ok(serde_json::from_slice::<T>(&bytes)?)
}

#[derive(Default)]
struct RetryState {
    attempts: u32,
    last_status: Option<u16>,
    last_error: Option<String>,
}

impl RetryState {
    /// Only reported once a request was actually retried.
    fn metadata(&self) -> Option<RetryMetadata> {
        (self.attempts > 1).then(|| RetryMetadata {
            attempts: self.attempts,
            last_status: self.last_status,
            last_error: self.last_error.clone(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_respects_max_and_jitter() {
        let retry = RetryConfig {
            max_attempts: 3,
            base_backoff: Duration::from_millis(500),
            max_backoff: Duration::from_secs(1),
            retry_post: true,
        };

        let delay = retry.backoff_delay(5);
        assert!(delay <= Duration::from_secs(1));
        assert!(delay >= Duration::from_millis(250));
    }

    #[test]
    fn post_is_not_retried_by_default() {
        let retry = RetryConfig::default();
        assert!(!retry.should_retry_status(&Method::POST, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retry.should_retry_status(&Method::GET, StatusCode::INTERNAL_SERVER_ERROR));
        assert!(retry
            .allowing_post()
            .should_retry_status(&Method::POST, StatusCode::SERVICE_UNAVAILABLE));
    }

    #[test]
    fn client_errors_are_never_retried() {
        let retry = RetryConfig::default().allowing_post();
        assert!(!retry.should_retry_status(&Method::POST, StatusCode::BAD_REQUEST));
        assert!(retry.should_retry_status(&Method::POST, StatusCode::TOO_MANY_REQUESTS));
    }

    #[test]
    fn retry_state_reports_only_real_retries() {
        let mut state = RetryState {
            attempts: 1,
            ..Default::default()
        };
        assert!(state.metadata().is_none());
        state.attempts = 2;
        state.last_status = Some(503);
        let meta = state.metadata().expect("metadata after retry");
        assert_eq!(meta.attempts, 2);
        assert_eq!(meta.last_status, Some(503));
    }

    #[test]
    fn parses_dingtalk_error_envelope() {
        let body = r#"{"code":"InvalidAuthentication","message":"token invalid","requestid":"abc"}"#;
        let err = parse_api_error_parts(
            StatusCode::UNAUTHORIZED,
            &HeaderMap::new(),
            body.to_string(),
            None,
        );
        assert_eq!(err.status, 401);
        assert_eq!(err.code.as_deref(), Some("InvalidAuthentication"));
        assert_eq!(err.message, "token invalid");
        assert_eq!(err.request_id.as_deref(), Some("abc"));
    }

    #[test]
    fn falls_back_to_raw_body_and_status_text() {
        let err = parse_api_error_parts(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            "upstream down".to_string(),
            None,
        );
        assert_eq!(err.message, "upstream down");

        let err = parse_api_error_parts(
            StatusCode::BAD_GATEWAY,
            &HeaderMap::new(),
            String::new(),
            None,
        );
        assert_eq!(err.message, "Bad Gateway");
        assert!(err.raw_body.is_none());
    }
}
