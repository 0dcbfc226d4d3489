use std::{
    collections::{hash_map::DefaultHasher, HashSet, VecDeque},
    hash::{Hash, Hasher},
    pin::Pin,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex,
    },
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use serde_json::Value;

use crate::{
    errors::{Error, Result, TransportError},
    identifiers::{MessageId, RunId},
    telemetry::StreamTelemetry,
    types::{RunOutput, RunStatus, StreamEvent, StreamEventKind},
};

/// Default failure message when a FAILED run carries no `lastError.message`.
pub(crate) const UNKNOWN_RUN_ERROR: &str = "Unknown error";

/// Event type, message it belongs to, and a digest of its text (or announced id/status).
///
/// Cumulative texts grow with every delta, so only their digest is remembered.
type DedupKey = (StreamEventKind, Option<MessageId>, u64);

fn digest(text: &str) -> u64 {
    let mut hasher = DefaultHasher::new();
    text.hash(&mut hasher);
    hasher.finish()
}

/// Outcome of decoding one `data:` line.
#[derive(Debug)]
pub(crate) enum Decoded {
    Event(StreamEvent),
    Malformed(Error),
}

/// Incremental decoder for the run event stream.
///
/// Input arrives as arbitrary byte chunks. Complete lines are processed as they appear:
/// `event:` sets the current event type and the next `data:` line is decoded against it.
/// The decoder keeps the cumulative text of the current message so delta events can
/// report the whole text so far.
#[derive(Debug, Default)]
pub(crate) struct RunDecoder {
    line: Vec<u8>,
    event_type: Option<String>,
    message_id: Option<MessageId>,
    text: String,
    seen: HashSet<DedupKey>,
    finished: bool,
}

impl RunDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `done` has been seen. Later input is ignored.
    pub fn is_finished(&self) -> bool {
        self.finished
    }

    pub fn push_chunk(&mut self, chunk: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        for &byte in chunk {
            if self.finished {
                break;
            }
            if byte == b'\n' {
                let line = std::mem::take(&mut self.line);
                self.process_line(&line, &mut out);
            } else {
                self.line.push(byte);
            }
        }
        out
    }

    /// Flush a trailing line that was not newline-terminated.
    pub fn finish(&mut self) -> Vec<Decoded> {
        let mut out = Vec::new();
        if !self.finished && !self.line.is_empty() {
            let line = std::mem::take(&mut self.line);
            self.process_line(&line, &mut out);
        }
        self.line.clear();
        out
    }

    fn process_line(&mut self, raw: &[u8], out: &mut Vec<Decoded>) {
        let decoded = String::from_utf8_lossy(raw);
        let line = decoded.trim_end_matches('\r');
        if line.is_empty() || line.starts_with(':') {
            return;
        }
        if let Some(rest) = line.strip_prefix("event:") {
            self.event_type = Some(rest.trim().to_string());
            return;
        }
        let Some(data) = line.strip_prefix("data:") else {
            return;
        };
        let data = data.trim();
        let event_type = self.event_type.clone().unwrap_or_default();

        let Some(kind) = StreamEventKind::from_event_name(&event_type) else {
            #[cfg(feature = "tracing")]
            tracing::debug!(event = %event_type, "skipping unrecognized stream event");
            return;
        };

        // The end marker's payload is not always JSON.
        if kind == StreamEventKind::Done {
            self.finished = true;
            #[cfg(feature = "tracing")]
            tracing::info!("run stream completed");
            out.push(Decoded::Event(StreamEvent::Done));
            return;
        }

        let payload: Value = match serde_json::from_str(data) {
            Ok(value) => value,
            Err(source) => {
                #[cfg(feature = "tracing")]
                tracing::error!(event = %event_type, error = %source, "failed to parse stream payload");
                out.push(Decoded::Malformed(Error::StreamDecode {
                    event: event_type,
                    source,
                }));
                return;
            }
        };

        // Checked before mapping: a replayed `message.created` must not reset the text.
        if let Some(key) = self.lifecycle_key(kind, &payload) {
            if !self.seen.insert(key) {
                return;
            }
        }

        if let Some(event) = self.map_event(kind, payload) {
            if self.is_duplicate(&event) {
                return;
            }
            out.push(Decoded::Event(event));
        }
    }

    fn map_event(&mut self, kind: StreamEventKind, data: Value) -> Option<StreamEvent> {
        match kind {
            StreamEventKind::RunCreated => {
                let run_id = str_field(&data, "runId").map(RunId::new);
                #[cfg(feature = "tracing")]
                tracing::info!(run_id = ?run_id, "run created");
                Some(StreamEvent::RunCreated { run_id, data })
            }
            StreamEventKind::MessageCreated => {
                let message_id = str_field(&data, "messageId").map(MessageId::new);
                #[cfg(feature = "tracing")]
                tracing::info!(message_id = ?message_id, "message created");
                self.message_id = message_id.clone();
                self.text.clear();
                Some(StreamEvent::MessageCreated { message_id, data })
            }
            StreamEventKind::MessageDelta => {
                let delta = data
                    .pointer("/delta/text/value")
                    .and_then(Value::as_str)
                    .filter(|s| !s.is_empty())?
                    .to_string();
                #[cfg(feature = "tracing")]
                tracing::debug!(delta = %delta, "delta received");
                self.text.push_str(&delta);
                Some(StreamEvent::MessageDelta {
                    delta,
                    text: self.text.clone(),
                    data,
                })
            }
            StreamEventKind::MessageCompleted => {
                let content = completed_content(&data);
                #[cfg(feature = "tracing")]
                tracing::info!(chars = self.text.chars().count(), "message completed");
                Some(StreamEvent::MessageCompleted {
                    text: self.text.clone(),
                    content,
                    data,
                })
            }
            StreamEventKind::RunCompleted => {
                let status = str_field(&data, "statusEnum")
                    .map(RunStatus::from)
                    .unwrap_or_else(|| RunStatus::Other(String::new()));
                #[cfg(feature = "tracing")]
                tracing::info!(status = %status, "run completed");
                let error = status.is_failed().then(|| {
                    data.pointer("/lastError/message")
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty())
                        .unwrap_or(UNKNOWN_RUN_ERROR)
                        .to_string()
                });
                Some(StreamEvent::RunCompleted {
                    status,
                    error,
                    data,
                })
            }
            StreamEventKind::Done => Some(StreamEvent::Done),
        }
    }

    /// Key of an event that carries no text, built from the id or status it announces.
    fn lifecycle_key(&self, kind: StreamEventKind, data: &Value) -> Option<DedupKey> {
        match kind {
            StreamEventKind::RunCreated => Some((
                kind,
                None,
                digest(&str_field(data, "runId").unwrap_or_default()),
            )),
            StreamEventKind::MessageCreated => Some((
                kind,
                str_field(data, "messageId").map(MessageId::new),
                digest(""),
            )),
            StreamEventKind::RunCompleted => Some((
                kind,
                self.message_id.clone(),
                digest(&str_field(data, "statusEnum").unwrap_or_default()),
            )),
            _ => None,
        }
    }

    fn is_duplicate(&mut self, event: &StreamEvent) -> bool {
        let Some(text) = event.text() else {
            return false;
        };
        let key = (event.kind(), self.message_id.clone(), digest(text));
        !self.seen.insert(key)
    }
}

fn str_field(data: &Value, key: &str) -> Option<String> {
    data.get(key)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

/// First text value of a completed message's `content` array.
fn completed_content(data: &Value) -> Option<String> {
    data.get("content")?
        .as_array()?
        .iter()
        .find_map(|part| {
            part.pointer("/text/value")
                .or_else(|| part.get("text"))
                .and_then(Value::as_str)
        })
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[derive(Debug, Default)]
struct RunProgress {
    saw_terminal: AtomicBool,
    run_id: Mutex<Option<RunId>>,
}

/// Streaming handle over the decoded events of one run.
///
/// Dropping the handle cancels the underlying response body.
pub struct RunStream {
    request_id: Option<String>,
    stream: Pin<Box<dyn Stream<Item = Result<StreamEvent>> + Send>>,
    cancelled: Arc<AtomicBool>,
    progress: Arc<RunProgress>,
    telemetry: Option<StreamTelemetry>,
}

impl RunStream {
    pub(crate) fn new(
        response: reqwest::Response,
        request_id: Option<String>,
        telemetry: Option<StreamTelemetry>,
    ) -> Self {
        Self::from_body(response.bytes_stream(), request_id, telemetry)
    }

    pub(crate) fn from_body<S, B>(
        body: S,
        request_id: Option<String>,
        telemetry: Option<StreamTelemetry>,
    ) -> Self
    where
        S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
        B: AsRef<[u8]> + Send + 'static,
    {
        let cancelled = Arc::new(AtomicBool::new(false));
        let stream = build_stream(body, cancelled.clone(), telemetry.clone());
        Self {
            request_id,
            stream: Box::pin(stream),
            cancelled,
            progress: Arc::default(),
            telemetry,
        }
    }

    /// Build a run stream from already-decoded events (useful for tests/mocks).
    pub fn from_events(events: impl IntoIterator<Item = StreamEvent>) -> Self {
        Self::from_results(events.into_iter().map(Ok).collect::<Vec<_>>())
    }

    /// Like [`from_events`](Self::from_events) but allows injecting errors.
    pub fn from_results(items: impl IntoIterator<Item = Result<StreamEvent>>) -> Self {
        let collected: Vec<Result<StreamEvent>> = items.into_iter().collect();
        Self {
            request_id: None,
            stream: Box::pin(stream::iter(collected)),
            cancelled: Arc::new(AtomicBool::new(false)),
            progress: Arc::default(),
            telemetry: None,
        }
    }

    /// Request identifier returned by the server (if any).
    pub fn request_id(&self) -> Option<&str> {
        self.request_id.as_deref()
    }

    /// Whether a `thread.run.completed` or `done` event has been yielded.
    pub fn saw_terminal(&self) -> bool {
        self.progress.saw_terminal.load(Ordering::SeqCst)
    }

    /// Run id from `thread.run.created`, once seen.
    pub fn run_id(&self) -> Option<RunId> {
        self.progress
            .run_id
            .lock()
            .ok()
            .and_then(|guard| guard.clone())
    }

    /// Stop reading the response body. The stream ends at the next poll.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Drain the run into its final text and status.
    ///
    /// Texts of successive messages are concatenated. A message that completed without
    /// deltas contributes its full content.
    pub async fn collect_text(mut self) -> Result<RunOutput> {
        let mut finished = String::new();
        let mut current = String::new();
        let mut status = None;
        let mut error = None;

        while let Some(item) = self.next().await {
            match item? {
                StreamEvent::MessageCreated { .. } => {
                    finished.push_str(&current);
                    current.clear();
                }
                StreamEvent::MessageDelta { text, .. } => current = text,
                StreamEvent::MessageCompleted { text, content, .. } => {
                    if text.is_empty() {
                        current = content.unwrap_or_default();
                    } else {
                        current = text;
                    }
                }
                StreamEvent::RunCompleted {
                    status: run_status,
                    error: run_error,
                    ..
                } => {
                    status = Some(run_status);
                    error = run_error;
                }
                StreamEvent::Done => break,
                StreamEvent::RunCreated { .. } => {}
            }
        }
        finished.push_str(&current);

        Ok(RunOutput {
            run_id: self.run_id(),
            text: finished,
            status,
            error,
        })
    }

    fn observe(&self, event: &StreamEvent) {
        if event.is_terminal() {
            self.progress.saw_terminal.store(true, Ordering::SeqCst);
        }
        if let StreamEvent::RunCreated {
            run_id: Some(id), ..
        } = event
        {
            if let Ok(mut slot) = self.progress.run_id.lock() {
                *slot = Some(id.clone());
            }
        }
    }
}

impl Drop for RunStream {
    fn drop(&mut self) {
        self.cancel();
        if let Some(t) = self.telemetry.take() {
            t.on_closed();
        }
    }
}

impl Stream for RunStream {
    type Item = Result<StreamEvent>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.get_mut();
        if this.cancelled.load(Ordering::SeqCst) {
            return Poll::Ready(None);
        }
        let polled = this.stream.as_mut().poll_next(cx);
        if let Poll::Ready(Some(Ok(event))) = &polled {
            this.observe(event);
        }
        polled
    }
}

struct DecodeState<S> {
    body: Pin<Box<S>>,
    decoder: RunDecoder,
    pending: VecDeque<StreamEvent>,
    cancelled: Arc<AtomicBool>,
    telemetry: Option<StreamTelemetry>,
    ended: bool,
}

impl<S> DecodeState<S> {
    /// Queue decoded events; malformed payloads only reach telemetry.
    ///
    /// The body is polled again only once the queue is drained, so it never holds more
    /// than one read's worth of events.
    fn enqueue(&mut self, decoded: Vec<Decoded>) {
        for item in decoded {
            match item {
                Decoded::Event(event) => self.pending.push_back(event),
                Decoded::Malformed(err) => {
                    if let (Some(t), Error::StreamDecode { event, .. }) =
                        (self.telemetry.as_ref(), &err)
                    {
                        t.on_decode_error(event, &err);
                    }
                }
            }
        }
    }

    fn emit(&self, event: &StreamEvent) {
        if let Some(t) = self.telemetry.as_ref() {
            t.on_event(event);
        }
    }

    fn fail(&mut self, err: &Error) {
        self.ended = true;
        self.pending.clear();
        if let Some(t) = self.telemetry.as_ref() {
            t.on_error(err);
        }
    }

    fn close(&self) {
        if let Some(t) = self.telemetry.as_ref() {
            t.on_closed();
        }
    }
}

fn build_stream<S, B>(
    body: S,
    cancelled: Arc<AtomicBool>,
    telemetry: Option<StreamTelemetry>,
) -> impl Stream<Item = Result<StreamEvent>> + Send
where
    S: Stream<Item = std::result::Result<B, reqwest::Error>> + Send + 'static,
    B: AsRef<[u8]> + Send + 'static,
{
    let state = DecodeState {
        body: Box::pin(body),
        decoder: RunDecoder::new(),
        pending: VecDeque::new(),
        cancelled,
        telemetry,
        ended: false,
    };

    stream::unfold(state, |mut state| async move {
        loop {
            if state.cancelled.load(Ordering::SeqCst) {
                state.close();
                return None;
            }
            if let Some(event) = state.pending.pop_front() {
                state.emit(&event);
                return Some((Ok(event), state));
            }
            if state.ended || state.decoder.is_finished() {
                state.close();
                return None;
            }
            match state.body.next().await {
                Some(Ok(chunk)) => {
                    let decoded = state.decoder.push_chunk(chunk.as_ref());
                    state.enqueue(decoded);
                }
                Some(Err(err)) => {
                    let error = Error::Transport(TransportError::from_reqwest(err, None));
                    state.fail(&error);
                    return Some((Err(error), state));
                }
                None => {
                    state.ended = true;
                    let decoded = state.decoder.finish();
                    state.enqueue(decoded);
                }
            }
        }
    })
}
