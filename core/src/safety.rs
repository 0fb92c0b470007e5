use std::path::PathBuf;

use serde::Deserialize;
use serde::Serialize;
use stepwise_apply_patch::PatchSummary;
use wildmatch::WildMatch;

use crate::protocol::ApprovalPolicy;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum SafetyLevel {
    Safe,
    AskUser,
    Reject,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatchSafetyDecision {
    pub level: SafetyLevel,
    pub reason: String,
    /// Every path the patch touches.
    pub paths: Vec<PathBuf>,
}

/// Classifies a parsed patch. Pure: only the summary, the policy and the
/// protected path globs are consulted.
///
/// Deletions need approval unless the policy says otherwise. A patch that
/// touches a protected path is rejected whatever the policy.
pub fn assess_patch_safety(
    summary: &PatchSummary,
    policy: ApprovalPolicy,
    protected_paths: &[String],
) -> PatchSafetyDecision {
    let paths = summary.paths();

    if let Some(path) = first_protected_path(&paths, protected_paths) {
        return PatchSafetyDecision {
            level: SafetyLevel::Reject,
            reason: format!("touches protected path {}", path.display()),
            paths,
        };
    }

    let (level, reason) = if summary.has_deletes() {
        (SafetyLevel::AskUser, "contains file deletion".to_string())
    } else {
        (SafetyLevel::Safe, "no file deletions".to_string())
    };

    let (level, reason) = match (policy, level) {
        (ApprovalPolicy::AlwaysAsk, SafetyLevel::Safe) => (
            SafetyLevel::AskUser,
            format!("approval policy is {policy}"),
        ),
        (ApprovalPolicy::AlwaysApprove, SafetyLevel::AskUser) => (
            SafetyLevel::Safe,
            format!("{reason}; auto-approved by policy {policy}"),
        ),
        _ => (level, reason),
    };

    PatchSafetyDecision {
        level,
        reason,
        paths,
    }
}

fn first_protected_path<'a>(paths: &'a [PathBuf], patterns: &[String]) -> Option<&'a PathBuf> {
    if patterns.is_empty() {
        return None;
    }
    let patterns: Vec<WildMatch> = patterns.iter().map(|p| WildMatch::new(p)).collect();
    paths.iter().find(|path| {
        let path = path.to_string_lossy();
        patterns.iter().any(|pattern| pattern.matches(&path))
    })
}
