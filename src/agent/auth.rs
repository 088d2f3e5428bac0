//! Bearer token handling for the agent backend.
//!
//! `TokenCache` hands out one cached token to every turn and refreshes it
//! `margin` before the issuer says it expires. The fetch itself sits behind
//! `TokenFetcher`; `ClientCredentials` is the OAuth2 client-credentials
//! implementation.

use crate::config::AgentConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::http::pool::truncate;
use async_trait::async_trait;
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info};

/// Default lifetime when the issuer omits `expires_in`.
const DEFAULT_TOKEN_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Clone, PartialEq)]
pub struct IssuedToken {
    pub access_token: String,
    pub expires_in: Duration,
}

#[async_trait]
pub trait TokenFetcher: Send + Sync {
    async fn fetch(&self) -> PipelineResult<IssuedToken>;
}

#[async_trait]
pub trait TokenProvider: Send + Sync {
    /// A token believed to be valid.
    async fn token(&self) -> PipelineResult<String>;

    /// Forget `token` after the backend rejected it. A newer token already
    /// cached by another caller is kept.
    async fn invalidate(&self, token: &str);
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: Option<u64>,
}

#[derive(Debug, Deserialize, Default)]
struct TokenErrorResponse {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

/// OAuth2 client-credentials grant against `{instance_url}/services/oauth2/token`.
pub struct ClientCredentials {
    client: reqwest::Client,
    token_url: String,
    client_id: String,
    client_secret: String,
}

impl ClientCredentials {
    pub fn new(client: reqwest::Client, config: &AgentConfig) -> Self {
        Self {
            client,
            token_url: format!("{}/services/oauth2/token", config.instance_url.trim_end_matches('/')),
            client_id: config.client_id.clone(),
            client_secret: config.client_secret.clone(),
        }
    }
}

#[async_trait]
impl TokenFetcher for ClientCredentials {
    async fn fetch(&self) -> PipelineResult<IssuedToken> {
        let response = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.client_id.as_str()),
                ("client_secret", self.client_secret.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let parsed: TokenErrorResponse = serde_json::from_str(&body).unwrap_or_default();
            let detail = parsed
                .error_description
                .or(parsed.error)
                .unwrap_or_else(|| truncate(&body, 200));
            let message = format!("token exchange returned {}: {}", status.as_u16(), detail);
            return Err(if status.is_server_error() || status.as_u16() == 429 {
                PipelineError::Backend(message)
            } else {
                PipelineError::AuthFailure(message)
            });
        }

        let token: TokenResponse = response.json().await?;
        Ok(IssuedToken {
            access_token: token.access_token,
            expires_in: token
                .expires_in
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_TOKEN_LIFETIME),
        })
    }
}

#[derive(Debug, Clone)]
struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Shared token with early refresh.
///
/// The lock is held across a refresh, so concurrent turns that find the
/// token stale wait for one exchange instead of each starting their own.
pub struct TokenCache {
    fetcher: Arc<dyn TokenFetcher>,
    margin: Duration,
    current: Mutex<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(fetcher: Arc<dyn TokenFetcher>, margin: Duration) -> Self {
        Self {
            fetcher,
            margin,
            current: Mutex::new(None),
        }
    }
}

#[async_trait]
impl TokenProvider for TokenCache {
    async fn token(&self) -> PipelineResult<String> {
        let mut current = self.current.lock().await;
        if let Some(cached) = current.as_ref() {
            if Instant::now() < cached.refresh_at {
                debug!("Using cached agent token");
                return Ok(cached.value.clone());
            }
        }

        let issued = self.fetcher.fetch().await?;
        let lifetime = issued.expires_in.saturating_sub(self.margin);
        info!(
            expires_in_secs = issued.expires_in.as_secs(),
            cached_for_secs = lifetime.as_secs(),
            "Fetched new agent token"
        );
        *current = Some(CachedToken {
            value: issued.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(issued.access_token)
    }

    async fn invalidate(&self, token: &str) {
        let mut current = self.current.lock().await;
        if current.as_ref().is_some_and(|cached| cached.value == token) {
            *current = None;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::http::test_server::serve;
    use actix_web::{web, HttpResponse};
    use serde_json::json;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn credentials(instance_url: &str, secret: &str) -> ClientCredentials {
        let mut config = AppConfig::default().agent;
        config.instance_url = format!("{}/", instance_url);
        config.client_id = "bridge-client".to_string();
        config.client_secret = secret.to_string();
        ClientCredentials::new(reqwest::Client::new(), &config)
    }

    fn token_server() -> String {
        serve(|cfg: &mut web::ServiceConfig| {
            cfg.route(
                "/services/oauth2/token",
                web::post().to(|form: web::Form<HashMap<String, String>>| async move {
                    let form = form.into_inner();
                    let grant_ok = form.get("grant_type").map(String::as_str) == Some("client_credentials");
                    let id_ok = form.get("client_id").map(String::as_str) == Some("bridge-client");
                    if !grant_ok || !id_ok {
                        return HttpResponse::BadRequest().json(json!({ "error": "unsupported_grant_type" }));
                    }
                    if form.get("client_secret").map(String::as_str) != Some("s3cret") {
                        return HttpResponse::BadRequest()
                            .json(json!({ "error": "invalid_client", "error_description": "invalid client credentials" }));
                    }
                    HttpResponse::Ok().json(json!({ "access_token": "00Dxx!token", "expires_in": 1800 }))
                }),
            );
        })
    }

    #[actix_web::test]
    async fn test_client_credentials_exchange() {
        let base = token_server();
        let issued = credentials(&base, "s3cret").fetch().await.unwrap();
        assert_eq!(
            issued,
            IssuedToken {
                access_token: "00Dxx!token".to_string(),
                expires_in: Duration::from_secs(1800),
            }
        );
    }

    #[actix_web::test]
    async fn test_rejected_client_is_auth_failure_with_description() {
        let base = token_server();
        match credentials(&base, "wrong").fetch().await {
            Err(PipelineError::AuthFailure(detail)) => assert!(detail.contains("invalid client credentials")),
            other => panic!("expected auth failure, got {:?}", other),
        }
    }

    #[actix_web::test]
    async fn test_issuer_outage_is_backend_error() {
        let base = serve(|cfg: &mut web::ServiceConfig| {
            cfg.route(
                "/services/oauth2/token",
                web::post().to(|| async { HttpResponse::ServiceUnavailable().body("maintenance") }),
            );
        });
        let result = credentials(&base, "s3cret").fetch().await;
        assert!(matches!(result, Err(PipelineError::Backend(_))));
    }

    struct CountingFetcher {
        calls: AtomicU32,
        expires_in: Duration,
    }

    #[async_trait]
    impl TokenFetcher for CountingFetcher {
        async fn fetch(&self) -> PipelineResult<IssuedToken> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(IssuedToken {
                access_token: format!("token-{}", n),
                expires_in: self.expires_in,
            })
        }
    }

    fn cache(expires_in: Duration) -> (TokenCache, Arc<CountingFetcher>) {
        let fetcher = Arc::new(CountingFetcher {
            calls: AtomicU32::new(0),
            expires_in,
        });
        (TokenCache::new(fetcher.clone(), Duration::from_secs(300)), fetcher)
    }

    #[tokio::test]
    async fn test_token_is_reused_until_margin() {
        let (cache, fetcher) = cache(Duration::from_secs(7200));
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(cache.token().await.unwrap(), "token-1");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_short_lived_token_is_refreshed_every_time() {
        // Lifetime inside the refresh margin
        let (cache, fetcher) = cache(Duration::from_secs(60));
        cache.token().await.unwrap();
        cache.token().await.unwrap();
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_invalidate_only_drops_matching_token() {
        let (cache, fetcher) = cache(Duration::from_secs(7200));
        let first = cache.token().await.unwrap();

        cache.invalidate("some-older-token").await;
        assert_eq!(cache.token().await.unwrap(), first);

        cache.invalidate(&first).await;
        assert_eq!(cache.token().await.unwrap(), "token-2");
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_refresh() {
        let (cache, fetcher) = cache(Duration::from_secs(7200));
        let cache = Arc::new(cache);
        let handles: Vec<_> = (0..10)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.token().await.unwrap() })
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.await.unwrap(), "token-1");
        }
        assert_eq!(fetcher.calls.load(Ordering::SeqCst), 1);
    }
}
