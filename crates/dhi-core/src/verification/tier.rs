//! Verification tier mapper: executed-command evidence to tier.
//!
//! Tier is assigned by the highest level whose commands all executed and
//! passed. Unexecuted checks cannot contribute. The AI-test rule is
//! mandatory: when every passing test in the run is AI-authored, the run
//! is labelled `AI_TESTS_ONLY` regardless of any L1/L2 claim that would
//! otherwise rest on those tests, and the manifest must surface the
//! human-review-required marker.

use super::result::{Authorship, CheckKind, CommandRecord, VerificationTier};

/// Assigns the verification tier for a run from its executed-command
/// evidence.
///
/// Returns `None` when the evidence supports no claim at all (no static
/// check executed and passed). A passing run with an empty command log is
/// a pipeline defect upstream; the executor never produces one.
#[must_use]
pub fn assign_tier(commands: &[CommandRecord]) -> Option<VerificationTier> {
    let statics: Vec<&CommandRecord> = commands.iter().filter(|c| c.kind.is_static()).collect();
    let l0 = !statics.is_empty() && statics.iter().all(|c| c.passed());

    let passing_tests: Vec<&CommandRecord> = commands
        .iter()
        .filter(|c| c.kind.is_test() && c.passed())
        .collect();

    // Mandatory override: tests passed, but none of them user-authored.
    if !passing_tests.is_empty()
        && passing_tests
            .iter()
            .all(|c| matches!(c.authorship, Authorship::Ai))
    {
        return Some(VerificationTier::AiTestsOnly);
    }

    if !l0 {
        return None;
    }

    let user_unit_passed = passing_tests
        .iter()
        .any(|c| c.kind == CheckKind::UnitTest && matches!(c.authorship, Authorship::User));
    let user_integration_passed = passing_tests
        .iter()
        .any(|c| c.kind == CheckKind::IntegrationTest && matches!(c.authorship, Authorship::User));

    // Failing tests of any kind pin the run below the level they guard.
    let all_unit_passed = commands
        .iter()
        .filter(|c| c.kind == CheckKind::UnitTest)
        .all(CommandRecord::passed);
    let all_integration_passed = commands
        .iter()
        .filter(|c| c.kind == CheckKind::IntegrationTest)
        .all(CommandRecord::passed);

    if user_unit_passed && all_unit_passed && user_integration_passed && all_integration_passed {
        return Some(VerificationTier::L2);
    }
    if user_unit_passed && all_unit_passed {
        return Some(VerificationTier::L1);
    }
    Some(VerificationTier::L0)
}
