//! Query orchestration: one thread per query, streamed back as text chunks.
//!
//! [`Invoker::invoke`] returns an [`Invocation`], a lazy stream of output chunks. Nothing
//! touches the network until it is first polled. The invocation then
//!
//! 1. opens a thread and posts the query as a user message,
//! 2. starts a streaming run and forwards only the new text of each delta,
//! 3. deletes the thread once the run ends, fails, or the invocation is dropped.
//!
//! Failures never surface as `Err`; they become a single human-readable chunk so the
//! host can show them verbatim.
//!
//! ```rust,ignore
//! use futures_util::StreamExt;
//!
//! let invoker = dingtalk_assistant::Client::from_env()?.invoker();
//! let mut output = invoker.invoke("Summarize today's approvals", None);
//! while let Some(chunk) = output.next().await {
//!     print!("{chunk}");
//! }
//! ```

use std::{
    pin::Pin,
    sync::{Arc, Mutex},
    task::{Context, Poll},
};

use futures_core::Stream;
use futures_util::{stream, StreamExt};
use serde_json::Value;

use crate::{
    errors::{Error, RequestError, Result},
    identifiers::{AssistantId, ThreadId},
    sse::{RunStream, UNKNOWN_RUN_ERROR},
    token_providers::BoxFuture,
    types::{Message, StreamEvent, Thread},
};

/// Chunk emitted for a blank query.
pub const EMPTY_QUERY_MESSAGE: &str = "Error: Question cannot be empty";

/// Chunk emitted when no assistant id is configured.
pub const MISSING_ASSISTANT_MESSAGE: &str = "Error: assistant id is not configured";

/// The remote operations an invocation needs.
///
/// [`Client`](crate::Client) is the production implementation.
pub trait AssistantApi: Send + Sync {
    fn assistant_id(&self) -> Option<&AssistantId>;

    fn create_thread(&self) -> BoxFuture<'_, Result<Thread>>;

    /// Post `content` as a user message.
    fn create_message<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message>>;

    fn create_run<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        assistant_id: &'a AssistantId,
        instructions: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RunStream>>;

    fn delete_thread<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<bool>>;
}

/// Lifecycle of one invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InvocationState {
    Idle,
    SessionOpen,
    MessageSent,
    Running,
    Completed,
    Failed,
    CleanedUp,
}

/// Entry point for running queries against an assistant.
#[derive(Clone)]
pub struct Invoker {
    api: Arc<dyn AssistantApi>,
}

impl Invoker {
    pub fn new(api: Arc<dyn AssistantApi>) -> Self {
        Self { api }
    }

    /// Run `query` with optional run `instructions`.
    pub fn invoke(&self, query: impl Into<String>, instructions: Option<String>) -> Invocation {
        Invocation::new(self.api.clone(), query.into(), instructions)
    }

    /// Run a query from raw tool parameters: `{"query": string, "instructions"?: string}`.
    ///
    /// A missing or non-string `query` is treated as blank.
    pub fn invoke_tool(&self, parameters: &Value) -> Invocation {
        let query = parameters
            .get("query")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .to_string();
        let instructions = parameters
            .get("instructions")
            .and_then(Value::as_str)
            .map(str::to_string);
        self.invoke(query, instructions)
    }
}

struct Shared {
    api: Arc<dyn AssistantApi>,
    state: Mutex<InvocationState>,
    /// Thread awaiting deletion. Taken exactly once.
    pending_thread: Mutex<Option<ThreadId>>,
}

impl Shared {
    fn state(&self) -> InvocationState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn set_state(&self, next: InvocationState) {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        #[cfg(feature = "tracing")]
        tracing::debug!(from = ?*state, to = ?next, "invocation state");
        *state = next;
    }

    fn hold_thread(&self, thread_id: ThreadId) {
        *self.pending_thread.lock().unwrap_or_else(|e| e.into_inner()) = Some(thread_id);
    }

    fn peek_thread(&self) -> Option<ThreadId> {
        self.pending_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn take_thread(&self) -> Option<ThreadId> {
        self.pending_thread
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take()
    }

    /// Delete the held thread, if any, and wait for the attempt to finish.
    ///
    /// The deletion runs as its own task when a Tokio runtime is available, so dropping
    /// the invocation mid-cleanup does not cancel it.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    async fn release(&self) {
        let Some(thread_id) = self.take_thread() else {
            return;
        };
        let delete = delete_quietly(self.api.clone(), thread_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                if let Err(err) = handle.spawn(delete).await {
                    #[cfg(feature = "tracing")]
                    tracing::error!(error = %err, "thread cleanup task did not finish");
                }
            }
            Err(_) => delete.await,
        }
        self.set_state(InvocationState::CleanedUp);
    }
}

/// Delete `thread_id`; failures are logged and swallowed.
#[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
async fn delete_quietly(api: Arc<dyn AssistantApi>, thread_id: ThreadId) {
    if let Err(err) = api.delete_thread(&thread_id).await {
        #[cfg(feature = "tracing")]
        tracing::warn!(thread_id = %thread_id, error = %err, "thread cleanup failed");
    }
}

/// Lazy stream of output chunks for one query.
///
/// Dropping it before the end still releases the thread: deletion is spawned on the
/// current Tokio runtime.
pub struct Invocation {
    stream: Pin<Box<dyn Stream<Item = String> + Send>>,
    shared: Arc<Shared>,
}

impl Invocation {
    fn new(api: Arc<dyn AssistantApi>, query: String, instructions: Option<String>) -> Self {
        let shared = Arc::new(Shared {
            api,
            state: Mutex::new(InvocationState::Idle),
            pending_thread: Mutex::new(None),
        });
        let flow = Flow {
            shared: shared.clone(),
            phase: Phase::Start {
                query,
                instructions,
            },
        };
        let stream = stream::unfold(flow, |mut flow| async move {
            let chunk = flow.next_chunk().await?;
            Some((chunk, flow))
        });
        Self {
            stream: Box::pin(stream),
            shared,
        }
    }

    pub fn state(&self) -> InvocationState {
        self.shared.state()
    }

    /// Thread currently held by the invocation (cleared once deletion is attempted).
    pub fn thread_id(&self) -> Option<ThreadId> {
        self.shared.peek_thread()
    }

    /// Drive the invocation to the end and concatenate every chunk.
    pub async fn collect_output(mut self) -> String {
        let mut output = String::new();
        while let Some(chunk) = self.next().await {
            output.push_str(&chunk);
        }
        output
    }
}

impl Stream for Invocation {
    type Item = String;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().stream.as_mut().poll_next(cx)
    }
}

impl Drop for Invocation {
    fn drop(&mut self) {
        let Some(thread_id) = self.shared.take_thread() else {
            return;
        };
        #[cfg(feature = "tracing")]
        tracing::info!(thread_id = %thread_id, "invocation dropped early; releasing thread");
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(delete_quietly(self.shared.api.clone(), thread_id));
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::error!(thread_id = %thread_id, "no async runtime; thread was not deleted");
            }
        }
    }
}

enum Phase {
    Start {
        query: String,
        instructions: Option<String>,
    },
    Streaming {
        run: RunStream,
        /// Text of the current message already handed out.
        emitted: String,
    },
    Release,
    Finished,
}

struct Flow {
    shared: Arc<Shared>,
    phase: Phase,
}

impl Flow {
    async fn next_chunk(&mut self) -> Option<String> {
        loop {
            match std::mem::replace(&mut self.phase, Phase::Finished) {
                Phase::Start {
                    query,
                    instructions,
                } => {
                    if query.trim().is_empty() {
                        self.shared.set_state(InvocationState::Failed);
                        return Some(EMPTY_QUERY_MESSAGE.to_string());
                    }
                    let Some(assistant_id) = self.shared.api.assistant_id().cloned() else {
                        #[cfg(feature = "tracing")]
                        tracing::error!("assistant id is not configured");
                        self.shared.set_state(InvocationState::Failed);
                        return Some(MISSING_ASSISTANT_MESSAGE.to_string());
                    };
                    match open_run(&self.shared, &query, &assistant_id, instructions.as_deref())
                        .await
                    {
                        Ok(run) => {
                            self.shared.set_state(InvocationState::Running);
                            self.phase = Phase::Streaming {
                                run,
                                emitted: String::new(),
                            };
                        }
                        Err(err) => return Some(self.fail(&err)),
                    }
                }
                Phase::Streaming { mut run, emitted } => {
                    let item = run.next().await;
                    match item {
                        Some(Ok(event)) => {
                            if let Some(chunk) = self.on_event(run, emitted, event) {
                                return Some(chunk);
                            }
                        }
                        Some(Err(err)) => return Some(self.fail(&err)),
                        None => {
                            if !run.saw_terminal() {
                                #[cfg(feature = "tracing")]
                                tracing::warn!("run stream ended without a completion event");
                            }
                            self.shared.set_state(InvocationState::Completed);
                            self.phase = Phase::Release;
                        }
                    }
                }
                Phase::Release => {
                    self.shared.release().await;
                    return None;
                }
                Phase::Finished => return None,
            }
        }
    }

    /// Apply one run event; returns the chunk to emit, if any.
    fn on_event(
        &mut self,
        run: RunStream,
        mut emitted: String,
        event: StreamEvent,
    ) -> Option<String> {
        let mut chunk = None;
        match event {
            StreamEvent::MessageCreated { .. } => emitted.clear(),
            StreamEvent::MessageDelta { text, .. } => {
                chunk = unseen_suffix(&emitted, &text);
                emitted = text;
            }
            StreamEvent::MessageCompleted { text, content, .. } => {
                if emitted.is_empty() {
                    let full = if text.is_empty() {
                        content.unwrap_or_default()
                    } else {
                        text
                    };
                    if !full.is_empty() {
                        chunk = Some(full.clone());
                        emitted = full;
                    }
                }
            }
            StreamEvent::RunCompleted { status, error, .. } if status.is_failed() => {
                let message = error.unwrap_or_else(|| UNKNOWN_RUN_ERROR.to_string());
                #[cfg(feature = "tracing")]
                tracing::error!(error = %message, "run failed");
                self.shared.set_state(InvocationState::Failed);
                self.phase = Phase::Release;
                return Some(format!("AI processing failed: {message}"));
            }
            StreamEvent::Done => {
                self.shared.set_state(InvocationState::Completed);
                self.phase = Phase::Release;
                return None;
            }
            StreamEvent::RunCreated { .. } | StreamEvent::RunCompleted { .. } => {}
        }
        self.phase = Phase::Streaming { run, emitted };
        chunk
    }

    fn fail(&mut self, err: &Error) -> String {
        #[cfg(feature = "tracing")]
        tracing::error!(error = %err, state = ?self.shared.state(), "invocation failed");
        self.shared.set_state(InvocationState::Failed);
        self.phase = Phase::Release;
        format!("An error occurred: {err}")
    }
}

/// Thread, message, run. The thread is registered for cleanup as soon as it exists.
async fn open_run(
    shared: &Shared,
    query: &str,
    assistant_id: &AssistantId,
    instructions: Option<&str>,
) -> Result<RunStream> {
    let thread = shared.api.create_thread().await?;
    let thread_id = thread
        .id
        .filter(|id| !id.is_empty())
        .ok_or(Error::SessionCreation(RequestError::MissingField("a thread id")))?;
    shared.hold_thread(thread_id.clone());
    shared.set_state(InvocationState::SessionOpen);

    shared.api.create_message(&thread_id, query).await?;
    shared.set_state(InvocationState::MessageSent);

    shared
        .api
        .create_run(&thread_id, assistant_id, instructions)
        .await
}

/// Text in `current` beyond what was already emitted.
fn unseen_suffix(emitted: &str, current: &str) -> Option<String> {
    let suffix = match current.strip_prefix(emitted) {
        Some(rest) => rest,
        // Text was rewritten rather than extended; resend it whole.
        None => current,
    };
    (!suffix.is_empty()).then(|| suffix.to_string())
}
