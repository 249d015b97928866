//! Bearer-token acquisition and caching for checks.
//!
//! `TokenCache` hands out a cached token while it is fresh. Refresh uses a
//! double-checked lock: concurrent callers that find the cache stale queue on
//! the write lock, and only the first of them performs the acquisition.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::Client;
use serde::Deserialize;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info};

use crate::config::{AuthConfig, TargetConfig};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("login request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("login rejected with status {status}: {body}")]
    Rejected { status: u16, body: String },

    #[error("login response carried no token")]
    MissingToken,

    #[error("no credentials configured (set auth.static_token or auth.email/auth.password)")]
    NoCredentials,
}

/// Performs the (expensive) acquisition of a fresh credential.
#[async_trait]
pub trait TokenSource: Send + Sync {
    async fn acquire(&self) -> Result<String, AuthError>;
}

/// A pre-issued token taken from configuration.
pub struct StaticToken(pub String);

#[async_trait]
impl TokenSource for StaticToken {
    async fn acquire(&self) -> Result<String, AuthError> {
        Ok(self.0.clone())
    }
}

/// Logs in against the target with email and password.
pub struct PasswordLogin {
    client: Client,
    url: String,
    email: String,
    password: String,
}

#[derive(Deserialize)]
struct LoginResponse {
    #[serde(alias = "token")]
    access_token: Option<String>,
}

impl PasswordLogin {
    pub fn new(client: Client, url: String, email: String, password: String) -> Self {
        Self {
            client,
            url,
            email,
            password,
        }
    }
}

#[async_trait]
impl TokenSource for PasswordLogin {
    async fn acquire(&self) -> Result<String, AuthError> {
        debug!(url = %self.url, "acquiring token");
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "email": self.email, "password": self.password }))
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(AuthError::Rejected {
                status: status.as_u16(),
                body,
            });
        }

        let login: LoginResponse = resp.json().await?;
        login
            .access_token
            .filter(|t| !t.is_empty())
            .ok_or(AuthError::MissingToken)
    }
}

/// Pick the token source the configuration describes.
pub fn source_from_config(
    auth: &AuthConfig,
    target: &TargetConfig,
    client: Client,
) -> Result<Arc<dyn TokenSource>, AuthError> {
    if let Some(token) = &auth.static_token {
        return Ok(Arc::new(StaticToken(token.clone())));
    }
    match (&auth.email, &auth.password) {
        (Some(email), Some(password)) => Ok(Arc::new(PasswordLogin::new(
            client,
            format!("{}{}", target.base_url.trim_end_matches('/'), auth.login_path),
            email.clone(),
            password.clone(),
        ))),
        _ => Err(AuthError::NoCredentials),
    }
}

#[derive(Clone)]
struct CachedToken {
    value: String,
    expires_at: DateTime<Utc>,
}

impl CachedToken {
    fn is_fresh(&self) -> bool {
        Utc::now() < self.expires_at
    }
}

/// Read-mostly cache in front of a `TokenSource`.
pub struct TokenCache {
    source: Arc<dyn TokenSource>,
    ttl: Duration,
    state: RwLock<Option<CachedToken>>,
}

impl TokenCache {
    pub fn new(source: Arc<dyn TokenSource>, ttl: Duration) -> Self {
        Self {
            source,
            ttl,
            state: RwLock::new(None),
        }
    }

    /// A cache whose source always fails with `NoCredentials`.
    pub fn unconfigured() -> Self {
        struct Missing;

        #[async_trait]
        impl TokenSource for Missing {
            async fn acquire(&self) -> Result<String, AuthError> {
                Err(AuthError::NoCredentials)
            }
        }

        Self::new(Arc::new(Missing), Duration::from_secs(60))
    }

    pub async fn get_token(&self) -> Result<String, AuthError> {
        {
            let state = self.state.read().await;
            if let Some(cached) = state.as_ref().filter(|c| c.is_fresh()) {
                return Ok(cached.value.clone());
            }
        }

        let mut state = self.state.write().await;
        // Another caller may have refreshed while we waited for the lock.
        if let Some(cached) = state.as_ref().filter(|c| c.is_fresh()) {
            return Ok(cached.value.clone());
        }

        let value = self.source.acquire().await?;
        let ttl = chrono::Duration::from_std(self.ttl).unwrap_or(chrono::Duration::zero());
        *state = Some(CachedToken {
            value: value.clone(),
            expires_at: Utc::now() + ttl,
        });
        info!(ttl_secs = self.ttl.as_secs(), "auth token refreshed");
        Ok(value)
    }

    pub async fn clear_token(&self) {
        *self.state.write().await = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counting {
        calls: AtomicUsize,
        delay: Duration,
    }

    #[async_trait]
    impl TokenSource for Counting {
        async fn acquire(&self) -> Result<String, AuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            tokio::time::sleep(self.delay).await;
            Ok(format!("token-{}", n))
        }
    }

    fn counting(delay: Duration) -> Arc<Counting> {
        Arc::new(Counting {
            calls: AtomicUsize::new(0),
            delay,
        })
    }

    #[tokio::test]
    async fn test_token_is_cached() {
        let source = counting(Duration::ZERO);
        let cache = TokenCache::new(source.clone(), Duration::from_secs(60));

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_refresh_acquires_once() {
        let source = counting(Duration::from_millis(50));
        let cache = Arc::new(TokenCache::new(source.clone(), Duration::from_secs(60)));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let cache = cache.clone();
                tokio::spawn(async move { cache.get_token().await.unwrap() })
            })
            .collect();

        for h in handles {
            assert_eq!(h.await.unwrap(), "token-1");
        }
        assert_eq!(source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_expired_token_is_refreshed() {
        let source = counting(Duration::ZERO);
        let cache = TokenCache::new(source.clone(), Duration::ZERO);

        assert_eq!(cache.get_token().await.unwrap(), "token-1");
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_clear_forces_reacquire() {
        let source = counting(Duration::ZERO);
        let cache = TokenCache::new(source.clone(), Duration::from_secs(60));

        cache.get_token().await.unwrap();
        cache.clear_token().await;
        assert_eq!(cache.get_token().await.unwrap(), "token-2");
    }

    #[tokio::test]
    async fn test_failure_is_surfaced_not_retried() {
        struct Failing(AtomicUsize);

        #[async_trait]
        impl TokenSource for Failing {
            async fn acquire(&self) -> Result<String, AuthError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Err(AuthError::MissingToken)
            }
        }

        let source = Arc::new(Failing(AtomicUsize::new(0)));
        let cache = TokenCache::new(source.clone(), Duration::from_secs(60));

        assert!(matches!(cache.get_token().await, Err(AuthError::MissingToken)));
        assert_eq!(source.0.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_source_from_config() {
        let target = TargetConfig::default();
        let mut auth = AuthConfig::default();
        assert!(matches!(
            source_from_config(&auth, &target, Client::new()),
            Err(AuthError::NoCredentials)
        ));

        auth.email = Some("qa@example.com".to_string());
        auth.password = Some("secret".to_string());
        assert!(source_from_config(&auth, &target, Client::new()).is_ok());

        auth.static_token = Some("abc".to_string());
        assert!(source_from_config(&auth, &target, Client::new()).is_ok());
    }
}
