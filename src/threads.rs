//! Thread and message operations of the assistant API.
//!
//! A thread is the server-side conversation an invocation runs in. The orchestrator
//! opens one per query, posts the user message into it and deletes it afterwards.
//!
//! ```rust,ignore
//! use dingtalk_assistant::{Client, Config, MessageRole};
//!
//! let client = Client::new(Config::from_env())?;
//! let thread = client.threads().create(None).await?;
//! let thread_id = thread.id.expect("thread id");
//! client
//!     .threads()
//!     .create_message(&thread_id, MessageRole::User, "What is on my calendar?")
//!     .await?;
//! client.threads().delete(&thread_id).await?;
//! ```

use std::sync::Arc;

use reqwest::Method;
use serde_json::{Map, Value};

use crate::{
    client::ClientInner,
    errors::{Error, Result, ValidationError},
    http::{read_json, RetryConfig},
    identifiers::ThreadId,
    telemetry::{RequestContext, SessionCleanupMetrics},
    types::{
        Message, MessageCreateRequest, MessageResponseBody, MessageRole, Thread,
        ThreadCreateRequest, ThreadResponseBody,
    },
};

pub(crate) const THREADS_PATH: &str = "/v1.0/assistant/threads";

/// Client for thread operations.
#[derive(Clone)]
pub struct ThreadsClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl ThreadsClient {
    /// Open a new thread.
    ///
    /// A response without `threadId`/`id` is not an error here; `Thread::id` is `None`
    /// and a warning is logged once per client.
    pub async fn create(&self, metadata: Option<Map<String, Value>>) -> Result<Thread> {
        #[cfg(feature = "tracing")]
        tracing::info!("creating assistant thread");
        let builder = self
            .inner
            .request(Method::POST, THREADS_PATH)?
            .json(&ThreadCreateRequest { metadata });
        let builder = self.inner.with_headers(builder, "application/json").await?;
        let builder = self.inner.with_timeout(builder, true);
        let ctx = RequestContext::new(Method::POST.as_str(), THREADS_PATH);

        let resp = self
            .inner
            .execute(builder, Method::POST, &self.inner.retry, ctx)
            .await
            .map_err(Error::SessionCreation)?;
        let body: ThreadResponseBody = read_json(resp).await.map_err(Error::SessionCreation)?;
        let thread = body.normalize();
        match &thread.id {
            #[cfg(feature = "tracing")]
            Some(id) => tracing::info!(thread_id = %id, "created assistant thread"),
            #[cfg(not(feature = "tracing"))]
            Some(_) => {}
            None => self.inner.warn_missing_id("thread"),
        }
        Ok(thread)
    }

    /// Post a message into `thread_id`.
    pub async fn create_message(
        &self,
        thread_id: &ThreadId,
        role: MessageRole,
        content: &str,
    ) -> Result<Message> {
        require_thread(thread_id)?;
        if content.trim().is_empty() {
            return Err(Error::Config(
                ValidationError::new("content is required").with_field("content"),
            ));
        }
        let path = format!("{THREADS_PATH}/{thread_id}/messages");
        #[cfg(feature = "tracing")]
        tracing::info!(thread_id = %thread_id, role = %role, "creating message");
        let builder = self
            .inner
            .request(Method::POST, &path)?
            .json(&MessageCreateRequest { role, content });
        let builder = self.inner.with_headers(builder, "application/json").await?;
        let builder = self.inner.with_timeout(builder, true);
        let ctx = RequestContext::new(Method::POST.as_str(), &path)
            .with_thread(Some(thread_id.clone()));

        let resp = self
            .inner
            .execute(builder, Method::POST, &self.inner.retry, ctx)
            .await
            .map_err(Error::MessageCreation)?;
        let body: MessageResponseBody = read_json(resp).await.map_err(Error::MessageCreation)?;
        let message = body.normalize(thread_id);
        if message.id.is_none() {
            self.inner.warn_missing_id("message");
        }
        Ok(message)
    }

    /// Delete `thread_id`.
    ///
    /// Sent exactly once, never retried. Returns `Ok(false)` when the thread was already
    /// gone (404). The outcome is reported to `metrics.session_cleanup`.
    pub async fn delete(&self, thread_id: &ThreadId) -> Result<bool> {
        require_thread(thread_id)?;
        let path = format!("{THREADS_PATH}/{thread_id}");
        #[cfg(feature = "tracing")]
        tracing::info!(thread_id = %thread_id, "deleting assistant thread");
        let builder = self.inner.request(Method::DELETE, &path)?;
        let builder = self.inner.with_headers(builder, "application/json").await?;
        let builder = self.inner.with_timeout(builder, true);
        let ctx = RequestContext::new(Method::DELETE.as_str(), &path)
            .with_thread(Some(thread_id.clone()));

        let result = self
            .inner
            .execute(builder, Method::DELETE, &RetryConfig::disabled(), ctx)
            .await;
        let outcome = match result {
            Ok(_) => Ok(true),
            Err(err) if err.status() == Some(404) => Ok(false),
            Err(source) => Err(Error::SessionDeletion {
                thread_id: thread_id.to_string(),
                source,
            }),
        };

        match &outcome {
            Ok(deleted) => {
                #[cfg(feature = "tracing")]
                tracing::info!(thread_id = %thread_id, deleted, "assistant thread released");
                self.inner.telemetry.record_cleanup(SessionCleanupMetrics {
                    thread_id: thread_id.clone(),
                    deleted: *deleted,
                    error: None,
                });
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(thread_id = %thread_id, error = %err, "failed to delete assistant thread");
                self.inner.telemetry.record_cleanup(SessionCleanupMetrics {
                    thread_id: thread_id.clone(),
                    deleted: false,
                    error: Some(err.to_string()),
                });
            }
        }
        outcome
    }
}

fn require_thread(thread_id: &ThreadId) -> Result<()> {
    if thread_id.is_empty() {
        return Err(Error::Config(
            ValidationError::new("thread_id is required").with_field("thread_id"),
        ));
    }
    Ok(())
}
