use std::{
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::{Duration, Instant},
};

use crate::{errors::Error, identifiers::ThreadId, types::StreamEvent, RetryMetadata};

/// User-provided callbacks for emitting structured events without taking on a tracing
/// dependency. Every component (token manager, client, decoder, invoker) receives the
/// same sink.
#[derive(Clone, Default)]
pub struct MetricsCallbacks {
    pub http_request: Option<Arc<dyn Fn(HttpRequestMetrics) + Send + Sync>>,
    pub token_refresh: Option<Arc<dyn Fn(TokenRefreshMetrics) + Send + Sync>>,
    pub stream_first_token: Option<Arc<dyn Fn(StreamFirstTokenMetrics) + Send + Sync>>,
    pub stream_decode_error: Option<Arc<dyn Fn(StreamDecodeMetrics) + Send + Sync>>,
    pub session_cleanup: Option<Arc<dyn Fn(SessionCleanupMetrics) + Send + Sync>>,
}

impl fmt::Debug for MetricsCallbacks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn slot<T: ?Sized>(cb: &Option<Arc<T>>) -> &'static str {
            if cb.is_some() {
                "set"
            } else {
                "unset"
            }
        }
        f.debug_struct("MetricsCallbacks")
            .field("http_request", &slot(&self.http_request))
            .field("token_refresh", &slot(&self.token_refresh))
            .field("stream_first_token", &slot(&self.stream_first_token))
            .field("stream_decode_error", &slot(&self.stream_decode_error))
            .field("session_cleanup", &slot(&self.session_cleanup))
            .finish()
    }
}

/// Common request metadata shared by all telemetry events.
#[derive(Clone, Debug, Default)]
pub struct RequestContext {
    pub method: String,
    pub path: String,
    pub thread_id: Option<ThreadId>,
    pub request_id: Option<String>,
}

impl RequestContext {
    pub fn new(method: impl Into<String>, path: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            path: path.into(),
            ..Default::default()
        }
    }

    pub fn with_thread(mut self, thread_id: Option<ThreadId>) -> Self {
        self.thread_id = thread_id.filter(|id| !id.is_empty());
        self
    }

    /// Blank ids are ignored and never overwrite one already set.
    pub fn with_request_id(mut self, request_id: Option<String>) -> Self {
        if let Some(id) = request_id.filter(|id| !id.trim().is_empty()) {
            self.request_id = Some(id);
        }
        self
    }
}

/// HTTP request latency and outcome.
#[derive(Clone, Debug)]
pub struct HttpRequestMetrics {
    pub latency: Duration,
    pub status: Option<u16>,
    pub error: Option<String>,
    pub retries: Option<RetryMetadata>,
    pub context: RequestContext,
}

/// Outcome of one access-token refresh against the issuance endpoint.
#[derive(Clone, Debug)]
pub struct TokenRefreshMetrics {
    pub app_key: String,
    pub latency: Duration,
    /// Lifetime granted by the server (absent on failure).
    pub expires_in: Option<Duration>,
    pub error: Option<String>,
}

/// Time from run start to the first decoded event.
#[derive(Clone, Debug)]
pub struct StreamFirstTokenMetrics {
    pub latency: Duration,
    pub error: Option<String>,
    pub context: RequestContext,
}

/// A `data:` payload that was skipped because it did not decode.
#[derive(Clone, Debug)]
pub struct StreamDecodeMetrics {
    pub event: String,
    pub error: String,
    pub context: RequestContext,
}

/// Result of the end-of-invocation thread deletion.
#[derive(Clone, Debug)]
pub struct SessionCleanupMetrics {
    pub thread_id: ThreadId,
    pub deleted: bool,
    pub error: Option<String>,
}

/// Fans metrics out to whichever callbacks were registered.
#[derive(Clone, Default)]
pub(crate) struct Telemetry {
    callbacks: MetricsCallbacks,
}

fn emit<M>(cb: &Option<Arc<dyn Fn(M) + Send + Sync>>, metrics: M) {
    if let Some(cb) = cb {
        cb(metrics);
    }
}

impl Telemetry {
    pub fn new(callbacks: Option<MetricsCallbacks>) -> Self {
        Self {
            callbacks: callbacks.unwrap_or_default(),
        }
    }

    pub fn http_enabled(&self) -> bool {
        self.callbacks.http_request.is_some()
    }

    pub fn stream_enabled(&self) -> bool {
        self.callbacks.stream_first_token.is_some()
            || self.callbacks.stream_decode_error.is_some()
    }

    pub fn record_http(&self, metrics: HttpRequestMetrics) {
        emit(&self.callbacks.http_request, metrics);
    }

    pub fn record_token_refresh(&self, metrics: TokenRefreshMetrics) {
        emit(&self.callbacks.token_refresh, metrics);
    }

    pub fn record_first_token(&self, metrics: StreamFirstTokenMetrics) {
        emit(&self.callbacks.stream_first_token, metrics);
    }

    pub fn record_decode_error(&self, metrics: StreamDecodeMetrics) {
        emit(&self.callbacks.stream_decode_error, metrics);
    }

    pub fn record_cleanup(&self, metrics: SessionCleanupMetrics) {
        emit(&self.callbacks.session_cleanup, metrics);
    }

    /// Per-run state, or `None` when nobody would observe it.
    pub fn stream_state(
        &self,
        context: RequestContext,
        start: Option<Instant>,
    ) -> Option<StreamTelemetry> {
        (self.stream_enabled() || tracing_enabled()).then(|| {
            StreamTelemetry::new(self.clone(), context, start.unwrap_or_else(Instant::now))
        })
    }
}

/// Shared stream metrics/tracing state for one run stream.
#[derive(Clone)]
pub(crate) struct StreamTelemetry {
    inner: Arc<StreamTelemetryInner>,
}

struct StreamTelemetryInner {
    telemetry: Telemetry,
    context: RequestContext,
    start: Instant,
    first_token_recorded: AtomicBool,
}

impl StreamTelemetry {
    pub fn new(telemetry: Telemetry, context: RequestContext, start: Instant) -> Self {
        Self {
            inner: Arc::new(StreamTelemetryInner {
                telemetry,
                context,
                start,
                first_token_recorded: AtomicBool::new(false),
            }),
        }
    }

    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub fn on_event(&self, event: &StreamEvent) {
        #[cfg(feature = "tracing")]
        tracing::trace!(
            event = %event.kind().as_str(),
            thread_id = ?self.inner.context.thread_id,
            "stream event"
        );
        self.record_first_token(None);
    }

    pub fn on_decode_error(&self, event: &str, error: &Error) {
        self.inner
            .telemetry
            .record_decode_error(StreamDecodeMetrics {
                event: event.to_string(),
                error: error.to_string(),
                context: self.inner.context.clone(),
            });
    }

    pub fn on_error(&self, error: &Error) {
        #[cfg(feature = "tracing")]
        tracing::warn!(error = %error, "stream error");
        self.record_first_token(Some(error.to_string()));
    }

    pub fn on_closed(&self) {
        self.record_first_token(Some("stream closed".to_string()));
    }

    /// Only the first event, error or close of a run counts.
    fn record_first_token(&self, error: Option<String>) {
        let inner = &self.inner;
        if inner.telemetry.callbacks.stream_first_token.is_none()
            || inner.first_token_recorded.swap(true, Ordering::SeqCst)
        {
            return;
        }
        inner.telemetry.record_first_token(StreamFirstTokenMetrics {
            latency: inner.start.elapsed(),
            error,
            context: inner.context.clone(),
        });
    }
}

#[cfg(feature = "tracing")]
pub(crate) fn tracing_enabled() -> bool {
    tracing::enabled!(tracing::Level::DEBUG)
}

#[cfg(not(feature = "tracing"))]
pub(crate) fn tracing_enabled() -> bool {
    false
}
