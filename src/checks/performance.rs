//! Latency budget checks.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use chrono::Utc;
use reqwest::Client;
use tokio_util::sync::CancellationToken;

use super::http::{join_url, send_or_cancel};
use super::{Category, Check};
use crate::model::CheckOutcome;

/// Issues `samples` sequential GETs and fails if the slowest exceeds `budget`.
pub struct LatencyCheck {
    client: Client,
    name: String,
    description: String,
    path: String,
    budget: Duration,
    samples: u32,
}

impl LatencyCheck {
    pub fn new(client: Client, name: &str, path: &str, budget: Duration) -> Self {
        Self {
            client,
            name: name.to_string(),
            description: format!("GET {} within {}ms", path, budget.as_millis()),
            path: path.to_string(),
            budget,
            samples: 3,
        }
    }

    pub fn samples(mut self, samples: u32) -> Self {
        self.samples = samples.max(1);
        self
    }
}

#[async_trait]
impl Check for LatencyCheck {
    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> Category {
        Category::Performance
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn run(&self, scope: &CancellationToken, base_url: &str, token: &str) -> CheckOutcome {
        let started = Utc::now();
        let url = join_url(base_url, &self.path);
        let mut slowest = Duration::ZERO;
        let mut total = Duration::ZERO;

        for _ in 0..self.samples {
            let t0 = Instant::now();
            let resp = match send_or_cancel(scope, self.client.get(&url).bearer_auth(token)).await
            {
                None => return CheckOutcome::skip(started, "cancelled before response"),
                Some(Err(e)) => {
                    return CheckOutcome::fail(started, format!("request failed: {}", e), Some(&e))
                }
                Some(Ok(resp)) => resp,
            };
            let elapsed = t0.elapsed();

            if !resp.status().is_success() {
                return CheckOutcome::fail(
                    started,
                    format!("unexpected status {}", resp.status().as_u16()),
                    None,
                );
            }
            slowest = slowest.max(elapsed);
            total += elapsed;
        }

        let mean = total / self.samples;
        tracing::debug!(
            check = %self.name,
            mean_ms = mean.as_millis() as u64,
            max_ms = slowest.as_millis() as u64,
            "latency sampled"
        );

        if slowest > self.budget {
            CheckOutcome::fail(
                started,
                format!(
                    "slowest response {}ms exceeds budget {}ms (mean {}ms)",
                    slowest.as_millis(),
                    self.budget.as_millis(),
                    mean.as_millis()
                ),
                None,
            )
        } else {
            CheckOutcome::pass(started)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_samples_floor() {
        let check = LatencyCheck::new(Client::new(), "p", "/", Duration::from_millis(100)).samples(0);
        assert_eq!(check.samples, 1);
        assert_eq!(check.description(), "GET / within 100ms");
    }
}
