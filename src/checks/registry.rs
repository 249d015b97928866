//! Suite name → ordered checks.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use tracing::warn;

use super::command::CommandCheck;
use super::http::{Credential, EndpointCheck};
use super::performance::LatencyCheck;
use super::security::{InjectionProbe, SecurityHeadersCheck, SQL_PAYLOADS, XSS_PAYLOADS};
use super::{Category, Check, CheckInfo, Suite};
use crate::config::Config;

/// Checks grouped by category, each group in registration order.
#[derive(Clone, Default)]
pub struct CheckRegistry {
    suites: BTreeMap<Category, Vec<Arc<dyn Check>>>,
}

impl CheckRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_check(mut self, check: Arc<dyn Check>) -> Self {
        self.register(check);
        self
    }

    pub fn register(&mut self, check: Arc<dyn Check>) {
        self.suites.entry(check.category()).or_default().push(check);
    }

    /// Checks to execute for `suite_name`, optionally narrowed to one check.
    ///
    /// Unknown suites and unmatched check names resolve to nothing.
    pub fn resolve(&self, suite_name: &str, check: Option<&str>) -> Vec<Arc<dyn Check>> {
        let suite: Suite = match suite_name.parse() {
            Ok(s) => s,
            Err(_) => return Vec::new(),
        };

        let all = suite
            .categories()
            .into_iter()
            .filter_map(|c| self.suites.get(&c))
            .flatten()
            .cloned();

        match check {
            Some(name) => all.filter(|c| c.name() == name).take(1).collect(),
            None => all.collect(),
        }
    }

    /// Every category with its registered checks, in suite order.
    pub fn suites(&self) -> Vec<(Category, Vec<CheckInfo>)> {
        Category::ALL
            .into_iter()
            .map(|c| {
                let infos = self
                    .suites
                    .get(&c)
                    .map(|checks| checks.iter().map(|ch| CheckInfo::of(ch.as_ref())).collect())
                    .unwrap_or_default();
                (c, infos)
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.suites.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The default check table plus any external checks from `config`.
    pub fn builtin(config: &Config, client: Client) -> Self {
        let c = || client.clone();
        let budget = Duration::from_millis(config.runner.latency_budget_ms);
        let mut reg = Self::new();

        // api
        let api: Vec<EndpointCheck> = vec![
            EndpointCheck::new(c(), "api-auth-flow", Category::Api, "/api/v1/auth/me")
                .describe("Authenticated profile lookup")
                .require_field("user.email"),
            EndpointCheck::new(
                c(),
                "api-marketplace-listings",
                Category::Api,
                "/api/v1/unified/listings?limit=5",
            )
            .describe("Listings endpoint returns data")
            .require_field("data"),
            EndpointCheck::new(c(), "api-categories-fetch", Category::Api, "/api/v1/admin/categories")
                .describe("Categories API returns data")
                .require_field("data"),
            EndpointCheck::new(
                c(),
                "api-search-functionality",
                Category::Api,
                "/api/v1/search?query=test&limit=5",
            )
            .describe("Search API answers a plain query"),
            EndpointCheck::new(c(), "api-admin-operations", Category::Api, "/api/v1/admin/admins")
                .describe("Admin listing is reachable with the runner's token")
                .require_field("data"),
            EndpointCheck::new(c(), "api-auth-invalid-token", Category::Api, "/api/v1/auth/me")
                .describe("Invalid bearer token is rejected")
                .credential(Credential::Invalid)
                .expect_status(&[401]),
            EndpointCheck::new(c(), "api-auth-missing-token", Category::Api, "/api/v1/auth/me")
                .describe("Missing bearer token is rejected")
                .credential(Credential::Missing)
                .expect_status(&[401]),
            EndpointCheck::new(
                c(),
                "api-search-invalid-params",
                Category::Api,
                "/api/v1/search?query=test&limit=-100",
            )
            .describe("Search tolerates a negative limit")
            .expect_status(&[200, 400]),
            EndpointCheck::new(
                c(),
                "api-search-empty-query",
                Category::Api,
                "/api/v1/search?query=&limit=5",
            )
            .describe("Search tolerates an empty query")
            .expect_status(&[200, 400]),
            EndpointCheck::new(
                c(),
                "api-search-unicode",
                Category::Api,
                "/api/v1/search?query=%D0%BA%D0%B2%D0%B0%D1%80%D1%82%D0%B8%D1%80%D0%B0&limit=5",
            )
            .describe("Search accepts a Cyrillic query"),
            EndpointCheck::new(
                c(),
                "api-listings-extreme-limit",
                Category::Api,
                "/api/v1/unified/listings?limit=10000",
            )
            .describe("Listings tolerate an oversized limit")
            .expect_status(&[200, 400]),
        ];
        for check in api {
            reg.register(Arc::new(check));
        }

        // integration
        reg.register(Arc::new(
            EndpointCheck::new(
                c(),
                "integration-listing-search-agree",
                Category::Integration,
                "/api/v1/search?query=test&limit=1",
            )
            .describe("Search index answers with a data envelope")
            .require_field("data"),
        ));
        reg.register(Arc::new(
            EndpointCheck::new(
                c(),
                "integration-profile-session",
                Category::Integration,
                "/api/v1/auth/me",
            )
            .describe("Session token resolves to a user id")
            .require_field("user.id"),
        ));

        // security
        reg.register(Arc::new(
            InjectionProbe::new(c(), "security-sql-injection", "/api/v1/search", "query", SQL_PAYLOADS)
                .describe("SQL injection payloads do not cause server errors"),
        ));
        reg.register(Arc::new(
            InjectionProbe::new(c(), "security-xss-reflection", "/api/v1/search", "query", XSS_PAYLOADS)
                .describe("XSS payloads are not reflected unescaped")
                .forbid_reflection(),
        ));
        reg.register(Arc::new(SecurityHeadersCheck::new(
            c(),
            "security-headers",
            "/api/v1/unified/listings?limit=1",
            &["x-content-type-options", "x-frame-options"],
        )));

        // performance
        reg.register(Arc::new(LatencyCheck::new(
            c(),
            "perf-listings-latency",
            "/api/v1/unified/listings?limit=20",
            budget,
        )));
        reg.register(Arc::new(LatencyCheck::new(
            c(),
            "perf-search-latency",
            "/api/v1/search?query=test&limit=20",
            budget,
        )));

        // data-integrity
        reg.register(Arc::new(
            EndpointCheck::new(
                c(),
                "data-categories-present",
                Category::DataIntegrity,
                "/api/v1/admin/categories",
            )
            .describe("Category table is populated")
            .require_field("data"),
        ));
        reg.register(Arc::new(
            EndpointCheck::new(
                c(),
                "data-listings-present",
                Category::DataIntegrity,
                "/api/v1/unified/listings?limit=1",
            )
            .describe("At least one listing record is readable")
            .require_field("data"),
        ));

        // monitoring
        reg.register(Arc::new(
            EndpointCheck::new(c(), "monitoring-health", Category::Monitoring, "/health")
                .describe("Health endpoint answers")
                .credential(Credential::Missing),
        ));

        // e2e / accessibility come from configuration
        for ext in &config.external {
            match CommandCheck::from_config(ext) {
                Ok(check) => reg.register(Arc::new(check)),
                Err(e) => warn!(check = %ext.name, error = %e, "skipping external check"),
            }
        }

        reg
    }
}
