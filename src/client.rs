use std::{
    collections::HashMap,
    fmt,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use reqwest::{
    header::{ACCEPT, USER_AGENT},
    Method,
};

use crate::{
    errors::{Error, RequestError, Result, TransportError, ValidationError},
    http::{send_with_retry, RetryConfig},
    identifiers::{AssistantId, ThreadId},
    invocation::{AssistantApi, Invoker},
    runs::RunsClient,
    sse::RunStream,
    telemetry::{MetricsCallbacks, RequestContext, Telemetry},
    threads::ThreadsClient,
    token_providers::{BoxFuture, CredentialTokenProvider, TokenManager, TokenProvider},
    types::{Credential, Message, MessageRole, Thread},
    ACCESS_TOKEN_HEADER, API_HOST_ENV, APP_KEY_ENV, APP_SECRET_ENV, ASSISTANT_ID_ENV,
    DEFAULT_BASE_URL, DEFAULT_CLIENT_HEADER, DEFAULT_CONNECT_TIMEOUT, DEFAULT_REQUEST_TIMEOUT,
};

#[derive(Clone, Default)]
pub struct Config {
    pub app_key: Option<String>,
    pub app_secret: Option<String>,
    /// Assistant that runs are started against. Invocations report a configuration
    /// error chunk when it is missing.
    pub assistant_id: Option<String>,
    /// Bare host (`api.dingtalk.com`, https implied) or a full base URL.
    pub api_host: Option<String>,
    pub client_header: Option<String>,
    pub http_client: Option<reqwest::Client>,
    /// Override the connect timeout (defaults to 5s).
    pub connect_timeout: Option<Duration>,
    /// Override the unary request timeout (defaults to 60s). Run streams are not bounded.
    pub timeout: Option<Duration>,
    /// Retry/backoff policy for unary calls.
    pub retry: Option<RetryConfig>,
    /// Optional metrics callbacks (HTTP latency, first event latency, decode errors, cleanup).
    pub metrics: Option<MetricsCallbacks>,
    /// Token cache to use. Defaults to the process-wide manager for the API host.
    pub token_manager: Option<Arc<TokenManager>>,
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("app_key", &self.app_key)
            .field("app_secret", &self.app_secret.as_ref().map(|_| "<redacted>"))
            .field("assistant_id", &self.assistant_id)
            .field("api_host", &self.api_host)
            .field("client_header", &self.client_header)
            .field("connect_timeout", &self.connect_timeout)
            .field("timeout", &self.timeout)
            .field("retry", &self.retry)
            .field("metrics", &self.metrics)
            .field("token_manager", &self.token_manager.as_ref().map(|_| "custom"))
            .finish()
    }
}

impl Config {
    /// Read `DINGTALK_APP_KEY`, `DINGTALK_APP_SECRET`, `DINGTALK_ASSISTANT_ID` and
    /// `DINGTALK_API_HOST`. Unset or blank variables are left as `None`.
    pub fn from_env() -> Self {
        let read = |name: &str| {
            std::env::var(name)
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        Self {
            app_key: read(APP_KEY_ENV),
            app_secret: read(APP_SECRET_ENV),
            assistant_id: read(ASSISTANT_ID_ENV),
            api_host: read(API_HOST_ENV),
            ..Default::default()
        }
    }

    /// Build a config from a host-supplied credential map.
    ///
    /// `app_key`, `app_secret` and `assistant_id` are required; `api_host` is optional.
    pub fn from_credentials(credentials: &HashMap<String, String>) -> Result<Self> {
        let required = |key: &str| {
            credentials
                .get(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
                .ok_or_else(|| {
                    Error::Config(ValidationError::new(format!(
                        "missing required credential: {key}"
                    )))
                })
        };
        Ok(Self {
            app_key: Some(required("app_key")?),
            app_secret: Some(required("app_secret")?),
            assistant_id: Some(required("assistant_id")?),
            api_host: credentials
                .get("api_host")
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            ..Default::default()
        })
    }
}

/// Resolve the configured host into a base URL (`https://` unless a scheme is given).
pub(crate) fn resolve_base_url(api_host: Option<&str>) -> Result<reqwest::Url> {
    let source = match api_host.map(str::trim).filter(|h| !h.is_empty()) {
        Some(host) if host.starts_with("http://") || host.starts_with("https://") => {
            host.to_string()
        }
        Some(host) => format!("https://{host}"),
        None => DEFAULT_BASE_URL.to_string(),
    };
    reqwest::Url::parse(source.trim_end_matches('/'))
        .map_err(|err| Error::config(format!("invalid api host: {err}")))
}

/// Async client for the DingTalk assistant API.
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

pub(crate) struct ClientInner {
    base_url: reqwest::Url,
    assistant_id: Option<AssistantId>,
    client_header: String,
    http: reqwest::Client,
    request_timeout: Duration,
    pub(crate) retry: RetryConfig,
    pub(crate) telemetry: Telemetry,
    tokens: CredentialTokenProvider,
    missing_id_warned: AtomicBool,
}

impl Client {
    pub fn new(cfg: Config) -> Result<Self> {
        let credential = Credential::new(
            cfg.app_key.unwrap_or_default(),
            cfg.app_secret.unwrap_or_default(),
        )?;
        let base_url = resolve_base_url(cfg.api_host.as_deref())?;

        let connect_timeout = cfg.connect_timeout.unwrap_or(DEFAULT_CONNECT_TIMEOUT);
        let request_timeout = cfg.timeout.unwrap_or(DEFAULT_REQUEST_TIMEOUT);
        let retry = cfg.retry.unwrap_or_default();

        let http = match cfg.http_client {
            Some(client) => client,
            None => reqwest::Client::builder()
                .connect_timeout(connect_timeout)
                .build()
                .map_err(|err| TransportError::connect("failed to build http client", err))?,
        };

        let manager = match cfg.token_manager {
            Some(manager) => manager,
            None => TokenManager::shared_for(base_url.as_str())?,
        };

        let client_header = cfg
            .client_header
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_CLIENT_HEADER.to_string());

        let assistant_id = cfg
            .assistant_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .map(AssistantId::new);

        Ok(Self {
            inner: Arc::new(ClientInner {
                base_url,
                assistant_id,
                client_header,
                http,
                request_timeout,
                retry,
                telemetry: Telemetry::new(cfg.metrics),
                tokens: CredentialTokenProvider::new(manager, credential),
                missing_id_warned: AtomicBool::new(false),
            }),
        })
    }

    /// Client built from [`Config::from_env`].
    pub fn from_env() -> Result<Self> {
        Self::new(Config::from_env())
    }

    pub fn threads(&self) -> ThreadsClient {
        ThreadsClient {
            inner: self.inner.clone(),
        }
    }

    pub fn runs(&self) -> RunsClient {
        RunsClient {
            inner: self.inner.clone(),
        }
    }

    pub fn assistant_id(&self) -> Option<&AssistantId> {
        self.inner.assistant_id.as_ref()
    }

    /// Orchestrator that runs queries against this client.
    pub fn invoker(&self) -> Invoker {
        Invoker::new(Arc::new(self.clone()))
    }

    /// Current access token for the configured credential.
    pub async fn access_token(&self) -> Result<String> {
        self.inner.tokens.get_token().await
    }
}

impl AssistantApi for Client {
    fn assistant_id(&self) -> Option<&AssistantId> {
        Client::assistant_id(self)
    }

    fn create_thread(&self) -> BoxFuture<'_, Result<Thread>> {
        Box::pin(async move { self.threads().create(None).await })
    }

    fn create_message<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        content: &'a str,
    ) -> BoxFuture<'a, Result<Message>> {
        Box::pin(async move {
            self.threads()
                .create_message(thread_id, MessageRole::User, content)
                .await
        })
    }

    fn create_run<'a>(
        &'a self,
        thread_id: &'a ThreadId,
        assistant_id: &'a AssistantId,
        instructions: Option<&'a str>,
    ) -> BoxFuture<'a, Result<RunStream>> {
        Box::pin(async move {
            self.runs()
                .create(thread_id, assistant_id, instructions)
                .await
        })
    }

    fn delete_thread<'a>(&'a self, thread_id: &'a ThreadId) -> BoxFuture<'a, Result<bool>> {
        Box::pin(async move { self.threads().delete(thread_id).await })
    }
}

impl ClientInner {
    pub(crate) fn request(&self, method: Method, path: &str) -> Result<reqwest::RequestBuilder> {
        let url = self
            .base_url
            .join(path)
            .map_err(|err| Error::config(format!("invalid request path {path}: {err}")))?;
        Ok(self.http.request(method, url))
    }

    /// Attach the access token, `Accept` and client identification headers.
    pub(crate) async fn with_headers(
        &self,
        builder: reqwest::RequestBuilder,
        accept: &str,
    ) -> Result<reqwest::RequestBuilder> {
        let token = self.tokens.get_token().await?;
        Ok(builder
            .header(ACCESS_TOKEN_HEADER, token)
            .header(ACCEPT, accept)
            .header(USER_AGENT, self.client_header.as_str()))
    }

    pub(crate) fn with_timeout(
        &self,
        builder: reqwest::RequestBuilder,
        use_default: bool,
    ) -> reqwest::RequestBuilder {
        if use_default {
            builder.timeout(self.request_timeout)
        } else {
            builder
        }
    }

    /// Send with retries. A 401 drops the cached token so the next call re-issues one.
    pub(crate) async fn execute(
        &self,
        builder: reqwest::RequestBuilder,
        method: Method,
        retry: &RetryConfig,
        ctx: RequestContext,
    ) -> std::result::Result<reqwest::Response, RequestError> {
        let result = send_with_retry(builder, method, retry, &self.telemetry, ctx).await;
        if let Err(err) = &result {
            if err.status() == Some(401) {
                #[cfg(feature = "tracing")]
                tracing::warn!("access token rejected; invalidating cached token");
                self.tokens.invalidate().await;
            }
        }
        result
    }

    /// Log once per client that a response carried no usable id.
    #[cfg_attr(not(feature = "tracing"), allow(unused_variables))]
    pub(crate) fn warn_missing_id(&self, what: &str) {
        if self.missing_id_warned.swap(true, Ordering::SeqCst) {
            return;
        }
        #[cfg(feature = "tracing")]
        tracing::warn!(resource = what, "response did not include an id");
    }
}
