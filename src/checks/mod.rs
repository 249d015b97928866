//! Check contract, suite names and the built-in verification checks.

pub mod command;
pub mod http;
pub mod performance;
pub mod registry;
pub mod security;

pub use self::registry::CheckRegistry;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::model::CheckOutcome;

/// A single named verification routine.
///
/// Implementations are stateless and may be invoked concurrently. They must
/// watch `scope` and return promptly once it is cancelled; nothing preempts a
/// check that ignores it. When a precondition does not hold in the target
/// environment, report `skipped` rather than `failed`.
#[async_trait]
pub trait Check: Send + Sync {
    fn name(&self) -> &str;

    fn category(&self) -> Category;

    fn description(&self) -> &str;

    async fn run(&self, scope: &CancellationToken, base_url: &str, token: &str) -> CheckOutcome;
}

/// The closed set of check categories. Each category is also a suite.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Category {
    Api,
    Integration,
    Security,
    Performance,
    DataIntegrity,
    E2e,
    Monitoring,
    Accessibility,
}

impl Category {
    /// Fixed order used by the `all` suite.
    pub const ALL: [Category; 8] = [
        Category::Api,
        Category::Integration,
        Category::Security,
        Category::Performance,
        Category::DataIntegrity,
        Category::E2e,
        Category::Monitoring,
        Category::Accessibility,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Category::Api => "api",
            Category::Integration => "integration",
            Category::Security => "security",
            Category::Performance => "performance",
            Category::DataIntegrity => "data-integrity",
            Category::E2e => "e2e",
            Category::Monitoring => "monitoring",
            Category::Accessibility => "accessibility",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_lowercase().replace('_', "-");
        Category::ALL
            .into_iter()
            .find(|c| c.as_str() == normalized)
            .ok_or_else(|| format!("unknown suite '{}'", s))
    }
}

/// A runnable suite: one category, or every category in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Suite {
    Only(Category),
    All,
}

impl Suite {
    pub fn categories(&self) -> Vec<Category> {
        match self {
            Suite::Only(c) => vec![*c],
            Suite::All => Category::ALL.to_vec(),
        }
    }
}

impl std::fmt::Display for Suite {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Suite::Only(c) => c.fmt(f),
            Suite::All => f.write_str("all"),
        }
    }
}

impl std::str::FromStr for Suite {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.trim().eq_ignore_ascii_case("all") {
            Ok(Suite::All)
        } else {
            s.parse().map(Suite::Only)
        }
    }
}

/// Listing form of a registered check.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckInfo {
    pub name: String,
    pub category: Category,
    pub description: String,
}

impl CheckInfo {
    pub fn of(check: &dyn Check) -> Self {
        Self {
            name: check.name().to_string(),
            category: check.category(),
            description: check.description().to_string(),
        }
    }
}

/// Cut `s` to at most `max` characters for error messages.
pub(crate) fn snippet(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let mut cut: String = s.chars().take(max).collect();
        cut.push('…');
        cut
    }
}
