//! Endpoint checks: one GET against the target, judged on status and shape.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::{Client, RequestBuilder, Response};
use tokio_util::sync::CancellationToken;

use super::{snippet, Category, Check};
use crate::model::CheckOutcome;

/// Token sent by negative checks that expect rejection.
const INVALID_TOKEN: &str = "invalid-token-for-negative-check";

/// Send `request` unless `scope` is cancelled first. `None` means cancelled.
pub(crate) async fn send_or_cancel(
    scope: &CancellationToken,
    request: RequestBuilder,
) -> Option<reqwest::Result<Response>> {
    tokio::select! {
        biased;
        _ = scope.cancelled() => None,
        resp = request.send() => Some(resp),
    }
}

pub(crate) fn join_url(base_url: &str, path: &str) -> String {
    format!("{}{}", base_url.trim_end_matches('/'), path)
}

/// How the request authenticates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credential {
    Bearer,
    Missing,
    Invalid,
}

pub struct EndpointCheck {
    client: Client,
    name: String,
    category: Category,
    description: String,
    path: String,
    credential: Credential,
    expect: Vec<u16>,
    require_field: Option<String>,
}

impl EndpointCheck {
    /// An authenticated GET of `path` expecting `200`.
    pub fn new(client: Client, name: &str, category: Category, path: &str) -> Self {
        Self {
            client,
            name: name.to_string(),
            category,
            description: format!("GET {}", path),
            path: path.to_string(),
            credential: Credential::Bearer,
            expect: vec![200],
            require_field: None,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn credential(mut self, credential: Credential) -> Self {
        self.credential = credential;
        self
    }

    pub fn expect_status(mut self, codes: &[u16]) -> Self {
        self.expect = codes.to_vec();
        self
    }

    /// Require a JSON field, addressed by a dotted path such as `user.email`.
    pub fn require_field(mut self, path: &str) -> Self {
        self.require_field = Some(path.to_string());
        self
    }
}

fn lookup<'a>(value: &'a serde_json::Value, dotted: &str) -> Option<&'a serde_json::Value> {
    dotted
        .split('.')
        .try_fold(value, |v, key| v.get(key))
        .filter(|v| !v.is_null())
}

#[async_trait]
impl Check for EndpointCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        self.category
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, scope: &CancellationToken, base_url: &str, token: &str) -> CheckOutcome {
        let started = Utc::now();
        let url = join_url(base_url, &self.path);

        let request = self.client.get(&url);
        let request = match self.credential {
            Credential::Bearer => request.bearer_auth(token),
            Credential::Invalid => request.bearer_auth(INVALID_TOKEN),
            Credential::Missing => request,
        };

        let resp = match send_or_cancel(scope, request).await {
            None => return CheckOutcome::skip(started, "cancelled before response"),
            Some(Err(e)) => {
                return CheckOutcome::fail(started, format!("request to {} failed: {}", url, e), Some(&e))
            }
            Some(Ok(resp)) => resp,
        };

        let status = resp.status().as_u16();
        if !self.expect.contains(&status) {
            let body = resp.text().await.unwrap_or_default();
            return CheckOutcome::fail(
                started,
                format!("expected status {:?}, got {}", self.expect, status),
                None,
            )
            .with_trace(snippet(&body, 512));
        }

        if let Some(field) = &self.require_field {
            let body: serde_json::Value = match resp.json().await {
                Ok(v) => v,
                Err(e) => {
                    return CheckOutcome::fail(started, "response is not valid JSON", Some(&e))
                }
            };
            if lookup(&body, field).is_none() {
                return CheckOutcome::fail(
                    started,
                    format!("missing field '{}' in response", field),
                    None,
                );
            }
        }

        CheckOutcome::pass(started)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::CheckStatus;
    use serde_json::json;

    #[test]
    fn test_lookup_dotted_fields() {
        let body = json!({ "user": { "email": "a@b.c", "phone": null }, "data": [] });
        assert!(lookup(&body, "user.email").is_some());
        assert!(lookup(&body, "data").is_some());
        assert!(lookup(&body, "user.phone").is_none());
        assert!(lookup(&body, "user.id").is_none());
        assert!(lookup(&body, "meta.total").is_none());
    }

    #[test]
    fn test_join_url() {
        assert_eq!(join_url("http://x/", "/api"), "http://x/api");
        assert_eq!(join_url("http://x", "/api"), "http://x/api");
    }

    #[test]
    fn test_builder() {
        let check = EndpointCheck::new(Client::new(), "api-auth-me", Category::Api, "/api/v1/auth/me")
            .credential(Credential::Missing)
            .expect_status(&[401]);
        assert_eq!(check.name(), "api-auth-me");
        assert_eq!(check.description(), "GET /api/v1/auth/me");
        assert_eq!(check.expect, vec![401]);
    }

    #[tokio::test]
    async fn test_cancelled_scope_skips() {
        let scope = CancellationToken::new();
        scope.cancel();
        // Port 9 (discard) on localhost: the request would fail or hang, but
        // the cancelled scope wins.
        let check = EndpointCheck::new(Client::new(), "c", Category::Api, "/");
        let outcome = check.run(&scope, "http://127.0.0.1:9", "t").await;
        assert_eq!(outcome.status, CheckStatus::Skipped);
    }
}
