//! Trigger rule matching
//!
//! Ref and path patterns are globs where `*` stops at `/` and `**` crosses
//! it, so `refs/heads/*` matches `refs/heads/main` but not
//! `refs/heads/feature/x`. An empty pattern list matches everything.

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};

use gantry_core::domain::trigger::{Trigger, TriggerAction};

use crate::error::{Error, Result};

/// Builds a glob set, or `None` for an empty pattern list
pub fn build_globset(patterns: &[String]) -> Result<Option<GlobSet>> {
    if patterns.is_empty() {
        return Ok(None);
    }
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = GlobBuilder::new(pattern)
            .literal_separator(true)
            .build()
            .map_err(|e| Error::Validation(format!("invalid glob pattern {}: {}", pattern, e)))?;
        builder.add(glob);
    }
    let set = builder
        .build()
        .map_err(|e| Error::Validation(format!("invalid glob patterns: {}", e)))?;
    Ok(Some(set))
}

/// A trigger with its patterns compiled
pub struct TriggerRule<'a> {
    trigger: &'a Trigger,
    refs: Option<GlobSet>,
    paths: Option<GlobSet>,
}

impl<'a> TriggerRule<'a> {
    pub fn compile(trigger: &'a Trigger) -> Result<Self> {
        Ok(Self {
            trigger,
            refs: build_globset(&trigger.ref_patterns)?,
            paths: build_globset(&trigger.path_patterns)?,
        })
    }

    pub fn trigger(&self) -> &Trigger {
        self.trigger
    }

    pub fn matches_action(&self, action: TriggerAction) -> bool {
        self.trigger.actions.is_empty() || self.trigger.actions.contains(&action)
    }

    /// Matches the full ref name, or its short form (`main` for
    /// `refs/heads/main`)
    pub fn matches_ref(&self, ref_name: &str) -> bool {
        let Some(refs) = &self.refs else {
            return true;
        };
        refs.is_match(ref_name) || refs.is_match(short_ref(ref_name))
    }

    /// Whether evaluating this rule needs the changed-path listing
    pub fn filters_paths(&self) -> bool {
        self.paths.is_some()
    }

    /// True if any changed path matches. A path-filtered rule never matches
    /// an empty change set.
    pub fn matches_paths(&self, changed: &[String]) -> bool {
        match &self.paths {
            None => true,
            Some(paths) => changed.iter().any(|p| paths.is_match(p)),
        }
    }
}

fn short_ref(ref_name: &str) -> &str {
    ref_name
        .strip_prefix("refs/heads/")
        .or_else(|| ref_name.strip_prefix("refs/tags/"))
        .unwrap_or(ref_name)
}

/// Whether a commit message opts out of CI
pub fn has_skip_marker(message: &str) -> bool {
    let lower = message.to_ascii_lowercase();
    lower.contains("[skip ci]") || lower.contains("[ci skip]")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use uuid::Uuid;

    fn trigger(actions: Vec<TriggerAction>, refs: &[&str], paths: &[&str]) -> Trigger {
        Trigger {
            id: Uuid::new_v4(),
            pipeline_id: Uuid::new_v4(),
            uid: "on-push".to_string(),
            description: None,
            actions,
            ref_patterns: refs.iter().map(|s| s.to_string()).collect(),
            path_patterns: paths.iter().map(|s| s.to_string()).collect(),
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_ref_globs_respect_separators() {
        let t = trigger(vec![], &["refs/heads/*"], &[]);
        let rule = TriggerRule::compile(&t).unwrap();
        assert!(rule.matches_ref("refs/heads/main"));
        assert!(!rule.matches_ref("refs/heads/feature/login"));
        assert!(!rule.matches_ref("refs/tags/v1.0.0"));

        let t = trigger(vec![], &["release/**"], &[]);
        let rule = TriggerRule::compile(&t).unwrap();
        assert!(rule.matches_ref("refs/heads/release/2024/q1"));
    }

    #[test]
    fn test_empty_lists_match_everything() {
        let t = trigger(vec![], &[], &[]);
        let rule = TriggerRule::compile(&t).unwrap();
        assert!(rule.matches_action(TriggerAction::TagCreated));
        assert!(rule.matches_ref("refs/anything"));
        assert!(!rule.filters_paths());
        assert!(rule.matches_paths(&[]));
    }

    #[test]
    fn test_actions_and_paths() {
        let t = trigger(vec![TriggerAction::BranchUpdated], &[], &["src/**/*.rs", "Cargo.toml"]);
        let rule = TriggerRule::compile(&t).unwrap();
        assert!(rule.matches_action(TriggerAction::BranchUpdated));
        assert!(!rule.matches_action(TriggerAction::BranchCreated));
        assert!(rule.matches_paths(&["docs/README.md".to_string(), "src/bus/mod.rs".to_string()]));
        assert!(!rule.matches_paths(&["docs/README.md".to_string()]));
        assert!(!rule.matches_paths(&[]));
    }

    #[test]
    fn test_invalid_glob_is_a_validation_error() {
        let err = build_globset(&["refs/heads/[".to_string()]).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_skip_markers() {
        assert!(has_skip_marker("docs: typo [skip ci]"));
        assert!(has_skip_marker("[CI SKIP] bump"));
        assert!(!has_skip_marker("skip the ci for now"));
    }
}
