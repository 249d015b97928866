//! Security probes: injection payloads and response hardening headers.

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::http::{join_url, send_or_cancel};
use super::{snippet, Category, Check};
use crate::model::CheckOutcome;

pub const SQL_PAYLOADS: &[&str] = &[
    "' OR '1'='1",
    "1; DROP TABLE users--",
    "' UNION SELECT NULL, NULL--",
];

pub const XSS_PAYLOADS: &[&str] = &[
    "<script>alert('xss')</script>",
    "<img src=x onerror=alert(1)>",
];

/// Sends each payload in a query parameter. Fails on any 5xx, and, when
/// `forbid_reflection` is set, on a verbatim echo of the payload.
pub struct InjectionProbe {
    client: Client,
    name: String,
    description: String,
    path: String,
    param: String,
    payloads: Vec<String>,
    forbid_reflection: bool,
}

impl InjectionProbe {
    pub fn new(client: Client, name: &str, path: &str, param: &str, payloads: &[&str]) -> Self {
        Self {
            client,
            name: name.to_string(),
            description: format!("Injection payloads against {}?{}=", path, param),
            path: path.to_string(),
            param: param.to_string(),
            payloads: payloads.iter().map(|p| p.to_string()).collect(),
            forbid_reflection: false,
        }
    }

    pub fn describe(mut self, description: &str) -> Self {
        self.description = description.to_string();
        self
    }

    pub fn forbid_reflection(mut self) -> Self {
        self.forbid_reflection = true;
        self
    }
}

#[async_trait]
impl Check for InjectionProbe {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        Category::Security
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, scope: &CancellationToken, base_url: &str, token: &str) -> CheckOutcome {
        let started = Utc::now();
        let url = join_url(base_url, &self.path);

        for payload in &self.payloads {
            let request = self
                .client
                .get(&url)
                .bearer_auth(token)
                .query(&[(self.param.as_str(), payload.as_str())]);

            let resp = match send_or_cancel(scope, request).await {
                None => return CheckOutcome::skip(started, "cancelled before response"),
                Some(Err(e)) => {
                    return CheckOutcome::fail(started, format!("request failed: {}", e), Some(&e))
                }
                Some(Ok(resp)) => resp,
            };

            let status = resp.status();
            if status.is_server_error() {
                return CheckOutcome::fail(
                    started,
                    format!("server error {} for payload {:?}", status.as_u16(), payload),
                    None,
                );
            }

            if self.forbid_reflection {
                let body = resp.text().await.unwrap_or_default();
                if body.contains(payload.as_str()) {
                    return CheckOutcome::fail(
                        started,
                        format!("payload {:?} reflected unescaped", payload),
                        None,
                    )
                    .with_trace(snippet(&body, 512));
                }
            }
        }

        CheckOutcome::pass(started)
    }
}

/// Requires hardening headers on a response.
pub struct SecurityHeadersCheck {
    client: Client,
    name: String,
    path: String,
    required: Vec<String>,
}

impl SecurityHeadersCheck {
    pub fn new(client: Client, name: &str, path: &str, required: &[&str]) -> Self {
        Self {
            client,
            name: name.to_string(),
            path: path.to_string(),
            required: required.iter().map(|h| h.to_ascii_lowercase()).collect(),
        }
    }
}

#[async_trait]
impl Check for SecurityHeadersCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        Category::Security
    }

    fn description(&self) -> &str {
        "Response carries hardening headers"
    }

    async fn run(&self, scope: &CancellationToken, base_url: &str, _token: &str) -> CheckOutcome {
        let started = Utc::now();
        let url = join_url(base_url, &self.path);

        let resp = match send_or_cancel(scope, self.client.get(&url)).await {
            None => return CheckOutcome::skip(started, "cancelled before response"),
            Some(Err(e)) => {
                return CheckOutcome::fail(started, format!("request failed: {}", e), Some(&e))
            }
            Some(Ok(resp)) => resp,
        };

        let missing: Vec<&str> = self
            .required
            .iter()
            .filter(|h| !resp.headers().contains_key(h.as_str()))
            .map(|h| h.as_str())
            .collect();

        if missing.is_empty() {
            CheckOutcome::pass(started)
        } else {
            CheckOutcome::fail(
                started,
                format!("missing headers: {}", missing.join(", ")),
                None,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_probe_builder() {
        let probe = InjectionProbe::new(
            Client::new(),
            "security-xss-search",
            "/api/v1/search",
            "query",
            XSS_PAYLOADS,
        )
        .forbid_reflection();
        assert_eq!(probe.payloads.len(), XSS_PAYLOADS.len());
        assert!(probe.forbid_reflection);
        assert_eq!(probe.category(), Category::Security);
    }

    #[test]
    fn test_headers_are_normalized() {
        let check = SecurityHeadersCheck::new(Client::new(), "h", "/", &["X-Frame-Options"]);
        assert_eq!(check.required, vec!["x-frame-options".to_string()]);
    }
}
