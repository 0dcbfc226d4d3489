use std::{sync::Arc, time::Instant};

use reqwest::{header::CONTENT_TYPE, Method};

use crate::{
    client::ClientInner,
    errors::{Error, Result, ValidationError},
    http::{request_id_from_headers, RetryConfig},
    identifiers::{AssistantId, ThreadId},
    sse::RunStream,
    telemetry::RequestContext,
    threads::THREADS_PATH,
    types::RunCreateRequest,
};

#[derive(Clone)]
pub struct RunsClient {
    pub(crate) inner: Arc<ClientInner>,
}

impl RunsClient {
    /// Start a streaming run of `assistant_id` on `thread_id`.
    ///
    /// The request is sent once and has no overall timeout; the returned stream lives as
    /// long as the run does. Blank `instructions` are omitted from the request.
    pub async fn create(
        &self,
        thread_id: &ThreadId,
        assistant_id: &AssistantId,
        instructions: Option<&str>,
    ) -> Result<RunStream> {
        if thread_id.is_empty() {
            return Err(Error::Config(
                ValidationError::new("thread_id is required").with_field("thread_id"),
            ));
        }
        if assistant_id.is_empty() {
            return Err(Error::Config(
                ValidationError::new("assistant_id is required").with_field("assistant_id"),
            ));
        }
        let instructions = instructions.map(str::trim).filter(|s| !s.is_empty());

        let path = format!("{THREADS_PATH}/{thread_id}/runs");
        #[cfg(feature = "tracing")]
        tracing::info!(thread_id = %thread_id, assistant_id = %assistant_id, "starting run");
        let builder = self
            .inner
            .request(Method::POST, &path)?
            .json(&RunCreateRequest {
                assistant_id,
                instructions,
                stream: true,
            });
        let builder = self.inner.with_headers(builder, "text/event-stream").await?;
        let builder = self.inner.with_timeout(builder, false);
        let ctx = RequestContext::new(Method::POST.as_str(), &path)
            .with_thread(Some(thread_id.clone()));

        let started = Instant::now();
        let resp = self
            .inner
            .execute(builder, Method::POST, &RetryConfig::disabled(), ctx.clone())
            .await
            .map_err(Error::RunStart)?;

        let content_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.trim().to_lowercase());
        if !content_type
            .as_deref()
            .is_some_and(|ct| ct.starts_with("text/event-stream"))
        {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                content_type = content_type.as_deref().unwrap_or("<missing>"),
                "run response is not an event stream; decoding anyway"
            );
        }

        let request_id = request_id_from_headers(resp.headers());
        let ctx = ctx.with_request_id(request_id.clone());
        let telemetry = self.inner.telemetry.stream_state(ctx, Some(started));
        Ok(RunStream::new(resp, request_id, telemetry))
    }
}
