//! Checks delegated to an external program (browser automation, a11y audits).
//!
//! The child receives `CHECKRUN_BASE_URL` and `CHECKRUN_TOKEN` in its
//! environment. Exit status 0 passes. A missing program is a skip, not a
//! failure. Cancelling the scope kills the child.

use std::process::Stdio;

use async_trait::async_trait;
use chrono::Utc;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use super::{snippet, Category, Check};
use crate::config::ExternalCheckConfig;
use crate::model::CheckOutcome;

pub struct CommandCheck {
    name: String,
    category: Category,
    description: String,
    program: String,
    args: Vec<String>,
    working_dir: Option<std::path::PathBuf>,
}

impl CommandCheck {
    pub fn new(name: &str, category: Category, program: &str, args: &[&str]) -> Self {
        Self {
            name: name.to_string(),
            category,
            description: format!("{} {}", program, args.join(" ")).trim().to_string(),
            program: program.to_string(),
            args: args.iter().map(|a| a.to_string()).collect(),
            working_dir: None,
        }
    }

    pub fn from_config(cfg: &ExternalCheckConfig) -> Result<Self, String> {
        let category: Category = cfg.suite.parse()?;
        let args: Vec<&str> = cfg.args.iter().map(String::as_str).collect();
        let mut check = Self::new(&cfg.name, category, &cfg.program, &args);
        if !cfg.description.is_empty() {
            check.description = cfg.description.clone();
        }
        check.working_dir = cfg.working_dir.clone();
        Ok(check)
    }
}

#[async_trait]
impl Check for CommandCheck {
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

        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args)
            .env("CHECKRUN_BASE_URL", base_url)
            .env("CHECKRUN_TOKEN", token)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
        }

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return CheckOutcome::skip(started, format!("'{}' is not installed", self.program))
            }
            Err(e) => {
                return CheckOutcome::fail(
                    started,
                    format!("failed to start '{}': {}", self.program, e),
                    Some(&e),
                )
            }
        };

        // Dropping the wait future drops the child, which kills it.
        let output = tokio::select! {
            biased;
            _ = scope.cancelled() => {
                return CheckOutcome::skip(started, "cancelled; child process killed")
            }
            out = child.wait_with_output() => out,
        };

        match output {
            Ok(out) if out.status.success() => CheckOutcome::pass(started),
            Ok(out) => {
                let stderr = String::from_utf8_lossy(&out.stderr);
                let stdout = String::from_utf8_lossy(&out.stdout);
                let detail = if stderr.trim().is_empty() { stdout } else { stderr };
                let code = out
                    .status
                    .code()
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string());
                let tail: String = {
                    let lines: Vec<&str> = detail.lines().collect();
                    let from = lines.len().saturating_sub(40);
                    lines[from..].join("\n")
                };
                CheckOutcome::fail(
                    started,
                    format!("'{}' exited with {}", self.program, code),
                    None,
                )
                .with_trace(snippet(&tail, 4000))
            }
            Err(e) => CheckOutcome::fail(started, format!("waiting for child failed: {}", e), Some(&e)),
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::model::CheckStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn test_exit_status_decides() {
        let scope = CancellationToken::new();

        let ok = CommandCheck::new("ok", Category::E2e, "sh", &["-c", "exit 0"]);
        assert_eq!(ok.run(&scope, "http://x", "t").await.status, CheckStatus::Passed);

        let bad = CommandCheck::new("bad", Category::E2e, "sh", &["-c", "echo nope >&2; exit 3"]);
        let outcome = bad.run(&scope, "http://x", "t").await;
        assert_eq!(outcome.status, CheckStatus::Failed);
        assert!(outcome.error.unwrap().contains("exited with 3"));
        assert!(outcome.trace.unwrap().contains("nope"));
    }

    #[tokio::test]
    async fn test_child_sees_target_and_token() {
        let scope = CancellationToken::new();
        let check = CommandCheck::new(
            "env",
            Category::E2e,
            "sh",
            &["-c", "test \"$CHECKRUN_BASE_URL\" = http://target && test \"$CHECKRUN_TOKEN\" = secret"],
        );
        let outcome = check.run(&scope, "http://target", "secret").await;
        assert_eq!(outcome.status, CheckStatus::Passed);
    }

    #[tokio::test]
    async fn test_missing_program_is_skipped() {
        let scope = CancellationToken::new();
        let check = CommandCheck::new("x", Category::Accessibility, "definitely-not-a-real-binary-4711", &[]);
        assert_eq!(check.run(&scope, "http://x", "t").await.status, CheckStatus::Skipped);
    }

    #[tokio::test]
    async fn test_cancel_kills_child() {
        let scope = CancellationToken::new();
        let check = CommandCheck::new("slow", Category::E2e, "sleep", &["30"]);

        let canceller = scope.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(100)).await;
            canceller.cancel();
        });

        let outcome = tokio::time::timeout(Duration::from_secs(5), check.run(&scope, "http://x", "t"))
            .await
            .expect("cancellation should end the check promptly");
        assert_eq!(outcome.status, CheckStatus::Skipped);
    }

    #[test]
    fn test_from_config() {
        let cfg = ExternalCheckConfig {
            suite: "accessibility".to_string(),
            name: "a11y-keyboard-navigation".to_string(),
            description: "Keyboard navigation".to_string(),
            program: "npx".to_string(),
            args: vec!["playwright".to_string(), "test".to_string()],
            working_dir: None,
        };
        let check = CommandCheck::from_config(&cfg).unwrap();
        assert_eq!(check.category(), Category::Accessibility);
        assert_eq!(check.description(), "Keyboard navigation");

        let bad = ExternalCheckConfig { suite: "nope".to_string(), ..cfg };
        assert!(CommandCheck::from_config(&bad).is_err());
    }
}
