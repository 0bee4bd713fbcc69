//! Startup self-checks
//!
//! Runs before the server accepts requests:
//! - Database connectivity and the client state table
//! - Data directory is writable
//! - Upstream and identity settings (missing ones are warnings; the affected
//!   routes answer with a configuration error until they are set)

use serde::Serialize;
use tracing::{error, info, warn};

use crate::config::Config;
use crate::proxy::ProxyRoute;
use crate::DbPool;

#[derive(Debug, Clone, Serialize)]
pub struct CheckResult {
    pub name: String,
    pub passed: bool,
    /// Whether failure should abort startup
    pub critical: bool,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl CheckResult {
    pub fn pass(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            passed: true,
            critical: false,
            message: message.into(),
            details: None,
        }
    }

    pub fn fail(name: impl Into<String>, message: impl Into<String>, critical: bool) -> Self {
        Self {
            name: name.into(),
            passed: false,
            critical,
            message: message.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StartupCheckReport {
    pub checks: Vec<CheckResult>,
    pub all_critical_passed: bool,
    pub all_passed: bool,
    pub summary: String,
}

impl StartupCheckReport {
    pub fn new(checks: Vec<CheckResult>) -> Self {
        let all_critical_passed = checks.iter().filter(|c| c.critical).all(|c| c.passed);
        let all_passed = checks.iter().all(|c| c.passed);

        let failed_critical = checks.iter().filter(|c| c.critical && !c.passed).count();
        let failed_non_critical = checks.iter().filter(|c| !c.critical && !c.passed).count();
        let total = checks.len();
        let passed = checks.iter().filter(|c| c.passed).count();

        let summary = if all_passed {
            format!("All {} startup checks passed", total)
        } else if all_critical_passed {
            format!(
                "{}/{} checks passed ({} non-critical warnings)",
                passed, total, failed_non_critical
            )
        } else {
            format!(
                "{}/{} checks passed ({} critical failures)",
                passed, total, failed_critical
            )
        };

        Self {
            checks,
            all_critical_passed,
            all_passed,
            summary,
        }
    }
}

pub async fn run_startup_checks(config: &Config, db: &DbPool) -> StartupCheckReport {
    info!("Running startup self-checks...");

    let checks = vec![
        check_database_connectivity(db).await,
        check_client_state_table(db).await,
        check_directory_writability(config),
        check_upstream_urls(config),
        check_identity(config),
    ];

    let report = StartupCheckReport::new(checks);

    for check in &report.checks {
        if check.passed {
            info!(check = %check.name, message = %check.message, "Startup check PASSED");
        } else if check.critical {
            error!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (CRITICAL)"
            );
        } else {
            warn!(
                check = %check.name,
                message = %check.message,
                details = ?check.details,
                "Startup check FAILED (non-critical)"
            );
        }
    }

    info!(
        summary = %report.summary,
        all_passed = report.all_passed,
        all_critical_passed = report.all_critical_passed,
        "Startup checks completed"
    );

    report
}

async fn check_database_connectivity(db: &DbPool) -> CheckResult {
    match sqlx::query("SELECT 1").fetch_one(db).await {
        Ok(_) => CheckResult::pass("database_connectivity", "Database connection successful"),
        Err(e) => CheckResult::fail(
            "database_connectivity",
            "Failed to connect to database",
            true,
        )
        .with_details(e.to_string()),
    }
}

async fn check_client_state_table(db: &DbPool) -> CheckResult {
    let result: Result<Option<(String,)>, _> = sqlx::query_as(
        "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'client_state'",
    )
    .fetch_optional(db)
    .await;

    match result {
        Ok(Some(_)) => CheckResult::pass("client_state_table", "Client state table present"),
        Ok(None) => CheckResult::fail(
            "client_state_table",
            "Client state table is missing",
            true,
        ),
        Err(e) => CheckResult::fail(
            "client_state_table",
            "Failed to query database schema",
            true,
        )
        .with_details(e.to_string()),
    }
}

fn check_directory_writability(config: &Config) -> CheckResult {
    let data_dir = &config.server.data_dir;
    let test_file = data_dir.join(".boxoffice_write_test");

    match std::fs::write(&test_file, "test") {
        Ok(_) => {
            let _ = std::fs::remove_file(&test_file);
            CheckResult::pass("directory_writability", "Data directory is writable")
                .with_details(format!("Path: {}", data_dir.display()))
        }
        Err(e) => CheckResult::fail(
            "directory_writability",
            "Data directory is not writable",
            true,
        )
        .with_details(format!("{}: {}", data_dir.display(), e)),
    }
}

fn check_upstream_urls(config: &Config) -> CheckResult {
    let missing: Vec<&str> = ProxyRoute::ALL
        .iter()
        .filter(|route| route.upstream_url(&config.upstream).is_none())
        .map(|route| route.path())
        .collect();

    if missing.is_empty() {
        CheckResult::pass("upstream_urls", "All upstream URLs configured")
    } else {
        CheckResult::fail("upstream_urls", "Some upstream URLs are not configured", false)
            .with_details(format!("Unavailable routes: {}", missing.join(", ")))
    }
}

fn check_identity(config: &Config) -> CheckResult {
    let has_url = config
        .identity
        .url
        .as_deref()
        .is_some_and(|u| !u.trim().is_empty());
    let has_key = config
        .identity
        .anon_key
        .as_deref()
        .is_some_and(|k| !k.trim().is_empty());

    match (has_url, has_key) {
        (true, true) => CheckResult::pass("identity", "Identity backend configured"),
        (false, _) => CheckResult::fail("identity", "Identity backend URL is not set", false)
            .with_details("Operators cannot sign in"),
        (true, false) => CheckResult::fail("identity", "Identity API key is not set", false),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_startup_check_report_all_passed() {
        let report = StartupCheckReport::new(vec![
            CheckResult::pass("a", "ok"),
            CheckResult::pass("b", "ok"),
        ]);
        assert!(report.all_passed);
        assert!(report.all_critical_passed);
        assert_eq!(report.summary, "All 2 startup checks passed");
    }

    #[test]
    fn test_startup_check_report_critical_failure() {
        let report = StartupCheckReport::new(vec![
            CheckResult::pass("a", "ok"),
            CheckResult::fail("b", "broken", true),
        ]);
        assert!(!report.all_critical_passed);
        assert!(report.summary.contains("1 critical failures"));
    }

    #[test]
    fn test_unconfigured_upstreams_are_warnings() {
        let result = check_upstream_urls(&Config::default());
        assert!(!result.passed);
        assert!(!result.critical);
        assert!(result.details.unwrap().contains("/api/emissao"));
    }

    #[test]
    fn test_identity_check() {
        let mut config = Config::default();
        assert!(!check_identity(&config).passed);

        config.identity.url = Some("https://auth.example.com".to_string());
        config.identity.anon_key = Some("anon".to_string());
        assert!(check_identity(&config).passed);
    }

    #[tokio::test]
    async fn test_database_checks() {
        let pool = sqlx::sqlite::SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .unwrap();
        assert!(check_database_connectivity(&pool).await.passed);
        assert!(!check_client_state_table(&pool).await.passed);

        crate::db::run_migrations(&pool).await.unwrap();
        assert!(check_client_state_table(&pool).await.passed);
    }
}
