//! Access-token acquisition and caching.
//!
//! Every assistant API call carries an access token minted from the application's
//! `appKey`/`appSecret`. Tokens live for a couple of hours; [`TokenManager`] caches
//! them per app key and refreshes them [`DEFAULT_REFRESH_SKEW`] before expiry.
//!
//! The manager is meant to be shared process-wide. [`TokenManager::global`] (or
//! [`TokenManager::shared_for`] for a non-default host) hands out one instance per
//! API host; tests build their own with [`TokenManager::new`] and substitute the
//! [`TokenIssuer`] and [`Clock`] seams.
//!
//! ```ignore
//! use dingtalk_assistant::TokenManager;
//!
//! let manager = TokenManager::global()?;
//! let token = manager.get_access_token("ding_app_key", "app_secret").await?;
//! ```

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};

use reqwest::Method;
use tokio::sync::RwLock;

use crate::errors::{APIError, Error, RequestError, Result, TransportError};
use crate::http::{read_json, send_with_retry, RetryConfig};
use crate::telemetry::{MetricsCallbacks, RequestContext, Telemetry, TokenRefreshMetrics};
use crate::types::{AccessTokenRequest, AccessTokenResponse, Credential};
use crate::{DEFAULT_BASE_URL, DEFAULT_CONNECT_TIMEOUT};

/// Default refresh skew (60 seconds before expiry).
pub const DEFAULT_REFRESH_SKEW: Duration = Duration::from_secs(60);

/// Upper bound on the `expireIn` the server can grant.
const MAX_TOKEN_LIFETIME: Duration = Duration::from_secs(24 * 60 * 60);

/// Path of the OAuth 2 access-token issuance endpoint.
pub(crate) const ACCESS_TOKEN_PATH: &str = "/v1.0/oauth2/accessToken";

/// Boxed future returned by the object-safe traits in this module.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Build the default HTTP client with standard timeouts.
///
/// Fails fast if the client cannot be built (e.g., TLS issues).
fn default_http_client() -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .connect_timeout(DEFAULT_CONNECT_TIMEOUT)
        .timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| Error::Transport(TransportError::connect("failed to build HTTP client", e)))
}

/// Source of the current time. Swapped for a manual clock in tests.
pub trait Clock: Send + Sync {
    fn now(&self) -> Instant;
}

/// Wall clock backed by [`Instant::now`].
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// Remote side of token acquisition.
pub trait TokenIssuer: Send + Sync {
    /// Mint a fresh token for `credential`.
    fn issue<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, std::result::Result<AccessTokenResponse, RequestError>>;
}

/// Issues tokens through `POST /v1.0/oauth2/accessToken`.
pub struct HttpTokenIssuer {
    url: reqwest::Url,
    http: reqwest::Client,
    retry: RetryConfig,
    telemetry: Telemetry,
}

impl HttpTokenIssuer {
    /// Issuer against `base_url` (scheme + host, e.g. `https://api.dingtalk.com`).
    pub fn new(base_url: &str) -> Result<Self> {
        Self::with_http_client(base_url, default_http_client()?)
    }

    pub fn with_http_client(base_url: &str, http: reqwest::Client) -> Result<Self> {
        let base = reqwest::Url::parse(base_url.trim_end_matches('/'))
            .map_err(|err| Error::config(format!("invalid base url: {err}")))?;
        let url = base
            .join(ACCESS_TOKEN_PATH)
            .map_err(|err| Error::config(format!("invalid token url: {err}")))?;
        Ok(Self {
            url,
            http,
            retry: RetryConfig::default(),
            telemetry: Telemetry::default(),
        })
    }

    /// Override the retry policy. Issuance is idempotent, so POST retries are implied.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    /// Report issuance HTTP requests to `metrics.http_request`.
    pub fn with_metrics(mut self, metrics: MetricsCallbacks) -> Self {
        self.telemetry = Telemetry::new(Some(metrics));
        self
    }
}

impl TokenIssuer for HttpTokenIssuer {
    fn issue<'a>(
        &'a self,
        credential: &'a Credential,
    ) -> BoxFuture<'a, std::result::Result<AccessTokenResponse, RequestError>> {
        Box::pin(async move {
            let builder = self
                .http
                .post(self.url.clone())
                .header(reqwest::header::ACCEPT, "application/json")
                .json(&AccessTokenRequest {
                    app_key: credential.app_key(),
                    app_secret: credential.app_secret(),
                });
            let ctx = RequestContext::new(Method::POST.as_str(), ACCESS_TOKEN_PATH);
            let resp = send_with_retry(
                builder,
                Method::POST,
                &self.retry.allowing_post(),
                &self.telemetry,
                ctx,
            )
            .await?;
            let body: AccessTokenResponse = read_json(resp).await?;
            if body.access_token.trim().is_empty() {
                return Err(RequestError::Api(APIError::new(
                    200,
                    "token response did not include accessToken",
                )));
            }
            Ok(body)
        })
    }
}

/// Trait for token providers that supply access tokens for API requests.
///
/// Implementations should handle caching and refresh automatically.
pub trait TokenProvider: Send + Sync {
    /// Returns a valid access token, refreshing if necessary.
    fn get_token(&self) -> BoxFuture<'_, Result<String>>;

    /// Drop any cached token so the next call refreshes (e.g. after a 401).
    fn invalidate(&self) -> BoxFuture<'_, ()> {
        Box::pin(async {})
    }
}

/// Cached token with expiry tracking.
#[derive(Clone)]
struct TokenCache {
    token: String,
    expires_at: Instant,
}

impl TokenCache {
    fn is_reusable(&self, now: Instant, skew: Duration) -> bool {
        if self.token.is_empty() {
            return false;
        }
        self.expires_at
            .checked_sub(skew)
            .is_some_and(|t| now < t)
    }
}

type Slot = Arc<RwLock<Option<TokenCache>>>;

/// Process-wide access-token cache keyed by app key.
///
/// Lookups for a key share a read lock; a refresh holds that key's write lock and
/// re-checks the cache once it has it, so concurrent callers trigger a single
/// refresh. Keys never block each other.
pub struct TokenManager {
    issuer: Arc<dyn TokenIssuer>,
    clock: Arc<dyn Clock>,
    refresh_skew: Duration,
    telemetry: Telemetry,
    slots: Mutex<HashMap<String, Slot>>,
}

impl TokenManager {
    pub fn new(issuer: Arc<dyn TokenIssuer>) -> Self {
        Self {
            issuer,
            clock: Arc::new(SystemClock),
            refresh_skew: DEFAULT_REFRESH_SKEW,
            telemetry: Telemetry::default(),
            slots: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// How long before expiry a cached token stops being handed out (default: 60s).
    pub fn with_refresh_skew(mut self, skew: Duration) -> Self {
        self.refresh_skew = skew;
        self
    }

    pub fn with_metrics(mut self, metrics: MetricsCallbacks) -> Self {
        self.telemetry = Telemetry::new(Some(metrics));
        self
    }

    /// Shared manager for the default DingTalk host.
    pub fn global() -> Result<Arc<TokenManager>> {
        Self::shared_for(DEFAULT_BASE_URL)
    }

    /// Shared manager for `base_url`, created on first use and reused afterward.
    pub fn shared_for(base_url: &str) -> Result<Arc<TokenManager>> {
        static SHARED: OnceLock<Mutex<HashMap<String, Arc<TokenManager>>>> = OnceLock::new();
        let key = base_url.trim_end_matches('/').to_string();
        let registry = SHARED.get_or_init(|| Mutex::new(HashMap::new()));
        let mut managers = registry.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = managers.get(&key) {
            return Ok(existing.clone());
        }
        let issuer = HttpTokenIssuer::new(&key)?;
        let manager = Arc::new(TokenManager::new(Arc::new(issuer)));
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    /// Return a valid token for the application, refreshing it when it is missing or
    /// within the refresh skew of expiry.
    pub async fn get_access_token(&self, app_key: &str, app_secret: &str) -> Result<String> {
        let credential = Credential::new(app_key, app_secret)?;
        self.token_for(&credential).await
    }

    /// Same as [`get_access_token`](Self::get_access_token) for a validated credential.
    pub async fn token_for(&self, credential: &Credential) -> Result<String> {
        let slot = self.slot(credential.app_key());

        {
            let cache = slot.read().await;
            if let Some(token) = self.reusable(cache.as_ref()) {
                return Ok(token);
            }
        }

        let mut cache = slot.write().await;
        // Another caller may have refreshed while we waited for the write lock.
        if let Some(token) = self.reusable(cache.as_ref()) {
            return Ok(token);
        }

        #[cfg(feature = "tracing")]
        tracing::info!(app_key = credential.app_key(), "refreshing access token");
        let now = self.clock.now();
        let started = Instant::now();
        match self.issuer.issue(credential).await {
            Ok(issued) => {
                let expires_in = Duration::from_secs(issued.expire_in).min(MAX_TOKEN_LIFETIME);
                *cache = Some(TokenCache {
                    token: issued.access_token.clone(),
                    // An unrepresentable deadline leaves the entry already stale.
                    expires_at: now.checked_add(expires_in).unwrap_or(now),
                });
                #[cfg(feature = "tracing")]
                tracing::info!(
                    app_key = credential.app_key(),
                    expires_in_secs = issued.expire_in,
                    "obtained access token"
                );
                self.telemetry.record_token_refresh(TokenRefreshMetrics {
                    app_key: credential.app_key().to_string(),
                    latency: started.elapsed(),
                    expires_in: Some(expires_in),
                    error: None,
                });
                Ok(issued.access_token)
            }
            Err(err) => {
                #[cfg(feature = "tracing")]
                tracing::error!(
                    app_key = credential.app_key(),
                    error = %err,
                    "failed to obtain access token"
                );
                self.telemetry.record_token_refresh(TokenRefreshMetrics {
                    app_key: credential.app_key().to_string(),
                    latency: started.elapsed(),
                    expires_in: None,
                    error: Some(err.to_string()),
                });
                Err(Error::TokenAcquisition(err))
            }
        }
    }

    /// Forget the cached token for `app_key`.
    pub async fn invalidate(&self, app_key: &str) {
        let slot = self.slot(app_key.trim());
        *slot.write().await = None;
    }

    fn reusable(&self, cache: Option<&TokenCache>) -> Option<String> {
        let cached = cache?;
        let now = self.clock.now();
        if cached.is_reusable(now, self.refresh_skew) {
            #[cfg(feature = "tracing")]
            tracing::debug!(
                expires_in_secs = cached.expires_at.saturating_duration_since(now).as_secs(),
                "using cached access token"
            );
            return Some(cached.token.clone());
        }
        None
    }

    fn slot(&self, app_key: &str) -> Slot {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.entry(app_key.to_string()).or_default().clone()
    }
}

/// [`TokenProvider`] that resolves tokens for one credential through a shared manager.
pub struct CredentialTokenProvider {
    manager: Arc<TokenManager>,
    credential: Credential,
}

impl CredentialTokenProvider {
    pub fn new(manager: Arc<TokenManager>, credential: Credential) -> Self {
        Self {
            manager,
            credential,
        }
    }

    pub fn credential(&self) -> &Credential {
        &self.credential
    }
}

impl TokenProvider for CredentialTokenProvider {
    fn get_token(&self) -> BoxFuture<'_, Result<String>> {
        Box::pin(self.manager.token_for(&self.credential))
    }

    fn invalidate(&self) -> BoxFuture<'_, ()> {
        Box::pin(self.manager.invalidate(self.credential.app_key()))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Clock that only moves when told to.
    struct ManualClock {
        base: Instant,
        offset: Mutex<Duration>,
    }

    impl ManualClock {
        fn new() -> Self {
            Self {
                base: Instant::now(),
                offset: Mutex::new(Duration::ZERO),
            }
        }

        fn advance(&self, by: Duration) {
            *self.offset.lock().unwrap() += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.base + *self.offset.lock().unwrap()
        }
    }

    /// Issuer that counts calls and hands out `token-<n>` with a fixed lifetime.
    struct CountingIssuer {
        calls: AtomicUsize,
        expire_in: u64,
        fail: bool,
    }

    impl CountingIssuer {
        fn new(expire_in: u64) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                expire_in,
                fail: false,
            }
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl TokenIssuer for CountingIssuer {
        fn issue<'a>(
            &'a self,
            _credential: &'a Credential,
        ) -> BoxFuture<'a, std::result::Result<AccessTokenResponse, RequestError>> {
            Box::pin(async move {
                let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
                tokio::task::yield_now().await;
                if self.fail {
                    return Err(RequestError::Api(APIError::new(503, "unavailable")));
                }
                Ok(AccessTokenResponse {
                    access_token: format!("token-{n}"),
                    expire_in: self.expire_in,
                })
            })
        }
    }

    fn manager(issuer: Arc<CountingIssuer>, clock: Arc<ManualClock>) -> TokenManager {
        TokenManager::new(issuer).with_clock(clock)
    }

    #[test]
    fn token_cache_not_reusable_when_empty() {
        let now = Instant::now();
        let cache = TokenCache {
            token: String::new(),
            expires_at: now + Duration::from_secs(3600),
        };
        assert!(!cache.is_reusable(now, Duration::from_secs(60)));
    }

    #[test]
    fn token_cache_not_reusable_within_skew() {
        let now = Instant::now();
        let cache = TokenCache {
            token: "test".to_string(),
            expires_at: now + Duration::from_secs(30),
        };
        assert!(!cache.is_reusable(now, Duration::from_secs(60)));
    }

    #[test]
    fn token_cache_reusable_when_fresh() {
        let now = Instant::now();
        let cache = TokenCache {
            token: "test".to_string(),
            expires_at: now + Duration::from_secs(120),
        };
        assert!(cache.is_reusable(now, Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn reuses_token_until_inside_refresh_window() {
        let issuer = Arc::new(CountingIssuer::new(7200));
        let clock = Arc::new(ManualClock::new());
        let manager = manager(issuer.clone(), clock.clone());

        let first = manager.get_access_token("key", "secret").await.unwrap();
        let second = manager.get_access_token("key", "secret").await.unwrap();
        assert_eq!(first, "token-1");
        assert_eq!(second, "token-1");
        assert_eq!(issuer.calls(), 1);

        // 120s of validity left: still cached.
        clock.advance(Duration::from_secs(7200 - 120));
        assert_eq!(
            manager.get_access_token("key", "secret").await.unwrap(),
            "token-1"
        );
        assert_eq!(issuer.calls(), 1);

        // 30s left: refreshed.
        clock.advance(Duration::from_secs(90));
        assert_eq!(
            manager.get_access_token("key", "secret").await.unwrap(),
            "token-2"
        );
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn concurrent_callers_share_one_refresh() {
        let issuer = Arc::new(CountingIssuer::new(7200));
        let manager = Arc::new(manager(issuer.clone(), Arc::new(ManualClock::new())));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let manager = manager.clone();
            handles.push(tokio::spawn(async move {
                manager.get_access_token("key", "secret").await
            }));
        }
        for handle in handles {
            assert_eq!(handle.await.unwrap().unwrap(), "token-1");
        }
        assert_eq!(issuer.calls(), 1);
    }

    #[tokio::test]
    async fn app_keys_are_cached_independently() {
        let issuer = Arc::new(CountingIssuer::new(7200));
        let manager = manager(issuer.clone(), Arc::new(ManualClock::new()));

        let a = manager.get_access_token("app-a", "secret").await.unwrap();
        let b = manager.get_access_token("app-b", "secret").await.unwrap();
        assert_ne!(a, b);
        assert_eq!(issuer.calls(), 2);
    }

    #[tokio::test]
    async fn empty_credentials_fail_without_network() {
        let issuer = Arc::new(CountingIssuer::new(7200));
        let manager = manager(issuer.clone(), Arc::new(ManualClock::new()));

        let err = manager.get_access_token("", "secret").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        let err = manager.get_access_token("key", "  ").await.unwrap_err();
        assert!(matches!(err, Error::Config(_)));
        assert_eq!(issuer.calls(), 0);
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_entry() {
        let clock = Arc::new(ManualClock::new());
        let good = Arc::new(CountingIssuer::new(7200));
        let manager = manager(good.clone(), clock.clone());
        manager.get_access_token("key", "secret").await.unwrap();

        // Swap in a failing issuer over the same cache.
        let failing = Arc::new(CountingIssuer {
            calls: AtomicUsize::new(0),
            expire_in: 7200,
            fail: true,
        });
        let manager = TokenManager {
            issuer: failing.clone(),
            ..manager
        };

        clock.advance(Duration::from_secs(7200 - 30));
        let err = manager.get_access_token("key", "secret").await.unwrap_err();
        assert!(matches!(err, Error::TokenAcquisition(_)));
        assert_eq!(failing.calls(), 1);

        let slot = manager.slot("key");
        let cached = slot.read().await.clone().expect("entry kept");
        assert_eq!(cached.token, "token-1");
    }

    #[tokio::test]
    async fn invalidate_forces_refresh() {
        let issuer = Arc::new(CountingIssuer::new(7200));
        let manager = manager(issuer.clone(), Arc::new(ManualClock::new()));
        manager.get_access_token("key", "secret").await.unwrap();
        manager.invalidate("key").await;
        assert_eq!(
            manager.get_access_token("key", "secret").await.unwrap(),
            "token-2"
        );
    }

    #[tokio::test]
    async fn refresh_outcomes_reach_metrics() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let metrics = MetricsCallbacks {
            token_refresh: Some({
                let seen = seen.clone();
                Arc::new(move |m: TokenRefreshMetrics| {
                    seen.lock().unwrap().push((m.app_key, m.expires_in, m.error));
                })
            }),
            ..Default::default()
        };
        let issuer = Arc::new(CountingIssuer::new(60 * 60));
        let manager = TokenManager::new(issuer)
            .with_clock(Arc::new(ManualClock::new()))
            .with_metrics(metrics);
        manager.get_access_token("key", "secret").await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].0, "key");
        assert_eq!(seen[0].1, Some(Duration::from_secs(3600)));
        assert!(seen[0].2.is_none());
    }

    #[tokio::test]
    async fn credential_provider_resolves_and_invalidates_its_key() {
        let issuer = Arc::new(CountingIssuer::new(60 * 60));
        let manager = Arc::new(manager(issuer.clone(), Arc::new(ManualClock::new())));
        let provider = CredentialTokenProvider::new(
            manager.clone(),
            Credential::new("bound", "secret").unwrap(),
        );

        assert_eq!(provider.get_token().await.unwrap(), "token-1");
        assert_eq!(provider.get_token().await.unwrap(), "token-1");
        provider.invalidate().await;
        assert_eq!(provider.get_token().await.unwrap(), "token-2");
        assert_eq!(issuer.calls(), 2);
        assert_eq!(provider.credential().app_key(), "bound");
    }

    #[test]
    fn shared_managers_are_keyed_by_host() {
        let a = TokenManager::shared_for("https://tokens-a.example.com/").unwrap();
        let b = TokenManager::shared_for("https://tokens-a.example.com").unwrap();
        let c = TokenManager::shared_for("https://tokens-b.example.com").unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert!(Arc::ptr_eq(
            &TokenManager::global().unwrap(),
            &TokenManager::global().unwrap()
        ));
    }

    #[tokio::test]
    async fn oversized_lifetime_is_capped() {
        let issuer = Arc::new(CountingIssuer::new(u64::MAX));
        let clock = Arc::new(ManualClock::new());
        let manager = manager(issuer.clone(), clock.clone());

        assert_eq!(manager.get_access_token("key", "secret").await.unwrap(), "token-1");
        clock.advance(Duration::from_secs(60 * 60));
        assert_eq!(manager.get_access_token("key", "secret").await.unwrap(), "token-1");
        clock.advance(MAX_TOKEN_LIFETIME);
        assert_eq!(manager.get_access_token("key", "secret").await.unwrap(), "token-2");
        assert_eq!(issuer.calls(), 2);
    }
}
