use std::{
    collections::VecDeque,
    sync::{Arc, Mutex},
    time::Duration,
};

use crate::{
    errors::{Error, Result},
    identifiers::{AssistantId, MessageId, ThreadId},
    invocation::{AssistantApi, Invoker},
    sse::RunStream,
    token_providers::BoxFuture,
    types::{Message, MessageRole, StreamEvent, Thread},
};

/// In-memory mock configuration for offline tests.
#[derive(Default)]
pub struct MockConfig {
    /// Assistant id reported to the orchestrator (`None` simulates a missing setting).
    pub assistant_id: Option<String>,
    /// One entry per run, consumed in order. Runs past the end stream nothing.
    pub runs: Vec<Vec<Result<StreamEvent>>>,
    pub thread_error: Option<Error>,
    pub message_error: Option<Error>,
    pub run_error: Option<Error>,
    pub delete_error: Option<Error>,
    /// How long each thread deletion takes to answer.
    pub delete_delay: Option<Duration>,
    /// Answer thread creation without an id.
    pub omit_thread_id: bool,
}

impl MockConfig {
    pub fn new(assistant_id: impl Into<String>) -> Self {
        Self {
            assistant_id: Some(assistant_id.into()),
            ..Default::default()
        }
    }

    pub fn with_run_events(mut self, events: Vec<StreamEvent>) -> Self {
        self.runs.push(events.into_iter().map(Ok).collect());
        self
    }

    pub fn with_run_results(mut self, events: Vec<Result<StreamEvent>>) -> Self {
        self.runs.push(events);
        self
    }

    pub fn with_thread_error(mut self, err: Error) -> Self {
        self.thread_error = Some(err);
        self
    }

    pub fn with_message_error(mut self, err: Error) -> Self {
        self.message_error = Some(err);
        self
    }

    pub fn with_run_error(mut self, err: Error) -> Self {
        self.run_error = Some(err);
        self
    }

    pub fn with_delete_error(mut self, err: Error) -> Self {
        self.delete_error = Some(err);
        self
    }

    pub fn with_delete_delay(mut self, delay: Duration) -> Self {
        self.delete_delay = Some(delay);
        self
    }

    pub fn without_thread_id(mut self) -> Self {
        self.omit_thread_id = true;
        self
    }
}

/// What the mock has been asked to do so far.
#[derive(Debug, Default, Clone)]
pub struct MockCalls {
    pub threads_created: usize,
    pub messages: Vec<(ThreadId, String)>,
    pub runs: Vec<(ThreadId, AssistantId, Option<String>)>,
    /// Deletions that ran to completion.
    pub deleted: Vec<ThreadId>,
}

/// [`AssistantApi`] backed by scripted responses.
#[derive(Clone)]
pub struct MockAssistant {
    inner: Arc<MockInner>,
}

struct MockInner {
    assistant_id: Option<AssistantId>,
    omit_thread_id: bool,
    delete_delay: Option<Duration>,
    runs: Mutex<VecDeque<Vec<Result<StreamEvent>>>>,
    thread_error: Mutex<Option<Error>>,
    message_error: Mutex<Option<Error>>,
    run_error: Mutex<Option<Error>>,
    delete_error: Mutex<Option<Error>>,
    calls: Mutex<MockCalls>,
}

impl MockAssistant {
    pub fn new(cfg: MockConfig) -> Self {
        Self {
            inner: Arc::new(MockInner {
                assistant_id: cfg.assistant_id.map(AssistantId::new),
                omit_thread_id: cfg.omit_thread_id,
                delete_delay: cfg.delete_delay,
                runs: Mutex::new(cfg.runs.into()),
                thread_error: Mutex::new(cfg.thread_error),
                message_error: Mutex::new(cfg.message_error),
                run_error: Mutex::new(cfg.run_error),
                delete_error: Mutex::new(cfg.delete_error),
                calls: Mutex::new(MockCalls::default()),
            }),
        }
    }

    pub fn invoker(&self) -> Invoker {
        Invoker::new(Arc::new(self.clone()))
    }

    /// Snapshot of recorded calls.
    pub fn calls(&self) -> MockCalls {
        self.inner.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    fn record<R>(&self, f: impl FnOnce(&mut MockCalls) -> R) -> R {
        let mut calls = self.inner.calls.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut calls)
    }
}

fn take(slot: &Mutex<Option<Error>>) -> Option<Error> {
    slot.lock().unwrap_or_else(|e| e.into_inner()).take()
}

impl AssistantApi for MockAssistant {
    fn assistant_id(&self) -> Option<&AssistantId> {
        self.inner.assistant_id.as_ref()
    }

    fn create_thread(&self) -> BoxFuture<'_, Result<Thread>> {
        Box::pin(async move {
            if let Some(err) = take(&self.inner.thread_error) {
                return Err(err);
            }
            let n = self.record(|calls| {
                calls.threads_created += 1;
                calls.threads_created
            });
            Ok(Thread {
                id: (!self.inner.omit_thread_id).then(|| ThreadId::new(format!("thread_mock_{n}"))),
                created_at: None,
                metadata: None,
            })
        })
    }

    fn create_message<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message>> {
        Box::pin(async move {
            if let Some(err) = take(&self.inner.message_error) {
                return Err(err);
            }
            let n = self.record(|calls| {
                calls.messages.push((thread_id.clone(), content.to_string()));
                calls.messages.len()
            });
            Ok(Message {
                id: Some(MessageId::new(format!("msg_mock_{n}"))),
                thread_id: thread_id.clone(),
                role: Some(MessageRole::User),
                created_at: None,
            })
        })
    }

    fn create_run<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        assistant_id: &'a AssistantId,
        instructions: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RunStream>> {
        Box::pin(async move {
            if let Some(err) = take(&self.inner.run_error) {
                return Err(err);
            }
            self.record(|calls| {
                calls.runs.push((
                    thread_id.clone(),
                    assistant_id.clone(),
                    instructions.map(str::to_string),
                ))
            });
            let script = self
                .inner
                .runs
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .pop_front()
                .unwrap_or_default();
            Ok(RunStream::from_results(script))
        })
    }

    fn delete_thread<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move {
            if let Some(delay) = self.inner.delete_delay {
                tokio::time::sleep(delay).await;
            }
            self.record(|calls| calls.deleted.push(thread_id.clone()));
            match take(&self.inner.delete_error) {
                Some(err) => Err(err),
                None => Ok(true),
            }
        })
    }
}

pub mod fixtures {
    use serde_json::{json, Value};

    use crate::{
        identifiers::{MessageId, RunId},
        types::{RunStatus, StreamEvent},
    };

    /// A complete streamed answer: run and message creation, one delta per piece,
    /// message and run completion, then `done`.
    pub fn streamed_answer(pieces: &[&str]) -> Vec<StreamEvent> {
        let mut events = vec![
            StreamEvent::RunCreated {
                run_id: Some(RunId::new("run_mock")),
                data: json!({"runId": "run_mock"}),
            },
            StreamEvent::MessageCreated {
                message_id: Some(MessageId::new("msg_assistant_mock")),
                data: json!({"messageId": "msg_assistant_mock"}),
            },
        ];
        let mut text = String::new();
        for piece in pieces {
            text.push_str(piece);
            events.push(StreamEvent::MessageDelta {
                delta: piece.to_string(),
                text: text.clone(),
                data: json!({"delta": {"text": {"value": piece}}}),
            });
        }
        events.push(StreamEvent::MessageCompleted {
            text,
            content: None,
            data: Value::Null,
        });
        events.push(run_completed(RunStatus::Completed, None));
        events.push(StreamEvent::Done);
        events
    }

    /// A run that ends with `statusEnum = FAILED`.
    pub fn failed_run(message: &str) -> Vec<StreamEvent> {
        vec![
            StreamEvent::RunCreated {
                run_id: Some(RunId::new("run_mock")),
                data: json!({"runId": "run_mock"}),
            },
            run_completed(RunStatus::Failed, Some(message.to_string())),
            StreamEvent::Done,
        ]
    }

    pub fn run_completed(status: RunStatus, error: Option<String>) -> StreamEvent {
        StreamEvent::RunCompleted {
            data: json!({"statusEnum": status.as_str()}),
            status,
            error,
        }
    }
}
