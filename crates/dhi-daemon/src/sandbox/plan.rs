//! Command plan construction.
//!
//! A run executes a declared ordered sequence: parse → lint → static type
//! check → smoke execution → user-authored unit tests → user-authored
//! integration tests → AI-authored tests. The plan is declared before
//! execution so its hash can participate in the determinism fingerprint;
//! commands dropped by fast mode are recorded as skipped checks rather
//! than silently omitted.

use dhi_core::verification::{Authorship, CheckKind, CommandSpec, SkippedCheck, VerificationMode};
use serde::{Deserialize, Serialize};

use super::backend::SOURCE_MOUNT;

/// Reason recorded for checks dropped by fast mode.
pub const FAST_MODE_SKIP_REASON: &str = "fast mode";

/// Per-project test suite configuration feeding the plan builder.
///
/// Each entry is the argument vector executed inside the sandbox; paths
/// reference the read-only source mount.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanConfig {
    /// Lint command, when the project configures one.
    #[serde(default)]
    pub lint: Option<Vec<String>>,
    /// Static type check command, when configured.
    #[serde(default)]
    pub type_check: Option<Vec<String>>,
    /// Pre-existing user-authored unit test command.
    #[serde(default)]
    pub user_unit_tests: Option<Vec<String>>,
    /// Pre-existing user-authored integration/e2e test command.
    #[serde(default)]
    pub user_integration_tests: Option<Vec<String>>,
    /// AI-authored test command (tier contribution only).
    #[serde(default)]
    pub ai_tests: Option<Vec<String>>,
}

/// Builds the declared plan for a mode, plus the checks that mode drops.
///
/// Fast mode truncates the plan to L0 checks and the smoke execution;
/// every configured test suite is surfaced as a skipped check so the
/// manifest can account for it.
#[must_use]
pub fn build_plan(
    mode: VerificationMode,
    config: &PlanConfig,
) -> (Vec<CommandSpec>, Vec<SkippedCheck>) {
    let candidate = format!("{SOURCE_MOUNT}/candidate.py");

    let mut plan = vec![
        CommandSpec::new(
            "parse",
            CheckKind::Parse,
            Authorship::User,
            ["python", "-m", "py_compile", candidate.as_str()],
        ),
        CommandSpec::new(
            "smoke",
            CheckKind::Smoke,
            Authorship::User,
            ["python", candidate.as_str()],
        ),
    ];

    if let Some(argv) = &config.lint {
        plan.insert(
            1,
            CommandSpec::new("lint", CheckKind::Lint, Authorship::User, argv.clone()),
        );
    }
    if let Some(argv) = &config.type_check {
        let position = plan.len() - 1; // before smoke
        plan.insert(
            position,
            CommandSpec::new("type-check", CheckKind::TypeCheck, Authorship::User, argv.clone()),
        );
    }

    let mut skipped = Vec::new();
    let mut push_test = |name: &str, kind: CheckKind, authorship: Authorship, argv: &Option<Vec<String>>| {
        let Some(argv) = argv else { return };
        if mode == VerificationMode::Fast {
            skipped.push(SkippedCheck::new(name, FAST_MODE_SKIP_REASON));
        } else {
            plan.push(CommandSpec::new(name, kind, authorship, argv.clone()));
        }
    };

    push_test(
        "user-unit",
        CheckKind::UnitTest,
        Authorship::User,
        &config.user_unit_tests,
    );
    push_test(
        "user-integration",
        CheckKind::IntegrationTest,
        Authorship::User,
        &config.user_integration_tests,
    );
    push_test("ai-tests", CheckKind::UnitTest, Authorship::Ai, &config.ai_tests);

    (plan, skipped)
}
