//! Streaming client for the DingTalk AI assistant API.
//!
//! The crate caches access tokens per application, drives the thread/message/run
//! lifecycle, and turns the run's server-sent events into plain text chunks.
#![cfg_attr(docsrs, feature(doc_cfg))]
// Error carries reqwest/serde sources inline; boxing them would only move the cost.
#![allow(clippy::result_large_err)]

use std::time::Duration;

/// Default API host.
pub const DEFAULT_API_HOST: &str = "api.dingtalk.com";

/// Default API base URL.
pub const DEFAULT_BASE_URL: &str = "https://api.dingtalk.com";

/// Default User-Agent header value.
pub(crate) const DEFAULT_CLIENT_HEADER: &str =
    concat!("dingtalk-assistant-rs/", env!("CARGO_PKG_VERSION"));

/// Default connection timeout (5 seconds).
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Default request timeout for unary calls (60 seconds).
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

/// HTTP header carrying the access token.
pub const ACCESS_TOKEN_HEADER: &str = "x-acs-dingtalk-access-token";

/// HTTP header name for request ID tracing.
pub const REQUEST_ID_HEADER: &str = "x-acs-request-id";

pub const APP_KEY_ENV: &str = "DINGTALK_APP_KEY";
pub const APP_SECRET_ENV: &str = "DINGTALK_APP_SECRET";
pub const ASSISTANT_ID_ENV: &str = "DINGTALK_ASSISTANT_ID";
pub const API_HOST_ENV: &str = "DINGTALK_API_HOST";

mod client;
mod errors;
mod http;
mod identifiers;
mod invocation;
#[cfg(any(test, feature = "mock"))]
mod mock;
mod runs;
mod sse;
mod telemetry;
mod threads;
mod token_providers;
mod types;

#[doc(hidden)]
pub mod testing;

pub use client::{Client, Config};
pub use errors::{
    APIError, Error, RequestError, Result, RetryMetadata, TransportError, TransportErrorKind,
    ValidationError,
};
pub use http::RetryConfig;
pub use identifiers::{AssistantId, MessageId, RunId, ThreadId};
pub use invocation::{
    AssistantApi, Invocation, InvocationState, Invoker, EMPTY_QUERY_MESSAGE,
    MISSING_ASSISTANT_MESSAGE,
};
#[cfg(feature = "mock")]
pub use mock::{fixtures, MockAssistant, MockCalls, MockConfig};
pub use runs::RunsClient;
pub use sse::RunStream;
pub use telemetry::{
    HttpRequestMetrics, MetricsCallbacks, RequestContext, SessionCleanupMetrics,
    StreamDecodeMetrics, StreamFirstTokenMetrics, TokenRefreshMetrics,
};
pub use threads::ThreadsClient;
pub use token_providers::{
    BoxFuture, Clock, CredentialTokenProvider, HttpTokenIssuer, SystemClock, TokenIssuer,
    TokenManager, TokenProvider, DEFAULT_REFRESH_SKEW,
};
pub use types::{
    AccessTokenResponse, Credential, Message, MessageRole, RunOutput, RunStatus, StreamEvent,
    StreamEventKind, Thread,
};
