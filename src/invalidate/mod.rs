/// Invalidation controller
///
/// Maps external signals (dependency drift, security advisories, execution
/// failures) to a cache decision for an entry. Pure decision logic; applying
/// the decision to the store belongs to the client.
use serde::{Deserialize, Serialize};

use crate::fingerprint::major_version;
use crate::store::Manifest;

/// External event that may invalidate a cached entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Signal {
    /// A pinned dependency resolved to a different or vulnerable version.
    DependencyDrift {
        dependency: String,
        resolved: String,
        #[serde(default)]
        vulnerable: bool,
    },
    /// A security advisory against a dependency or the template contract.
    Advisory { subject: String },
    /// The entry failed at execution time.
    ExecutionFailure {
        /// Whether regeneration could plausibly fix the failure, as opposed
        /// to bad input data.
        fixable: bool,
    },
}

/// What to do with a cached entry in response to a signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    /// Entry stays valid.
    Keep,
    /// Discard the stored entry and regenerate under the same identity.
    RegenerateSameFingerprint,
    /// The identity itself changed (template major bump); the old entry is
    /// retained for requests still pinned to the old contract.
    RegenerateNewFingerprint,
}

/// Decide how a signal affects an entry. The template contract version
/// currently in force decides between same-identity and new-identity
/// regeneration.
pub fn should_invalidate(
    manifest: &Manifest,
    signal: &Signal,
    current_template_version: &str,
) -> Decision {
    if !signal_actionable(manifest, signal) {
        return Decision::Keep;
    }

    // An actionable signal under a changed template major regenerates under
    // a new identity; the old entry stays for requests pinned to the old
    // contract.
    if major_version(&manifest.template_version) != major_version(current_template_version) {
        Decision::RegenerateNewFingerprint
    } else {
        Decision::RegenerateSameFingerprint
    }
}

/// Whether a signal actually applies to this entry and warrants
/// regeneration.
fn signal_actionable(manifest: &Manifest, signal: &Signal) -> bool {
    match signal {
        // Pinned deps shield the entry from plain drift; vulnerable
        // resolutions act.
        Signal::DependencyDrift {
            dependency,
            vulnerable,
            ..
        } => *vulnerable && depends_on(manifest, dependency),
        Signal::Advisory { subject } => depends_on(manifest, subject),
        Signal::ExecutionFailure { fixable } => *fixable,
    }
}

/// Match a dependency name against the manifest's pinned declarations,
/// ignoring version specifiers (`requests==2.31.0` depends on `requests`).
fn depends_on(manifest: &Manifest, name: &str) -> bool {
    manifest.deps.iter().any(|dep| {
        let dep_name = dep
            .split(['=', '<', '>', '~', '!', ' ', '['])
            .next()
            .unwrap_or(dep);
        dep_name.eq_ignore_ascii_case(name)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{content_sha, Permissions};
    use chrono::Utc;
    use std::collections::BTreeMap;

    fn manifest(deps: &[&str], template_version: &str) -> Manifest {
        Manifest {
            fingerprint: "0123456789abcdef".parse().unwrap(),
            prompt_sha: "aa".into(),
            context_sha: "bb".into(),
            language: "python".into(),
            entry: "script.py".into(),
            runtime: BTreeMap::new(),
            deps: deps.iter().map(|d| d.to_string()).collect(),
            allow: Permissions::default(),
            template_version: template_version.into(),
            created_at: Utc::now(),
            outputs: BTreeMap::new(),
            aliases: BTreeMap::new(),
            content_sha: content_sha("script", ""),
        }
    }

    #[test]
    fn test_plain_drift_on_pinned_dep_keeps_entry() {
        let m = manifest(&["requests==2.31.0"], "1.0.0");
        let signal = Signal::DependencyDrift {
            dependency: "requests".into(),
            resolved: "2.32.0".into(),
            vulnerable: false,
        };
        assert_eq!(should_invalidate(&m, &signal, "1.0.0"), Decision::Keep);
    }

    #[test]
    fn test_vulnerable_dep_regenerates_same_identity() {
        let m = manifest(&["requests==2.31.0"], "1.0.0");
        let signal = Signal::DependencyDrift {
            dependency: "requests".into(),
            resolved: "2.31.0".into(),
            vulnerable: true,
        };
        assert_eq!(
            should_invalidate(&m, &signal, "1.0.0"),
            Decision::RegenerateSameFingerprint
        );
    }

    #[test]
    fn test_drift_on_unrelated_dep_keeps_entry() {
        let m = manifest(&["moviepy==1.0.3"], "1.0.0");
        let signal = Signal::DependencyDrift {
            dependency: "requests".into(),
            resolved: "0.0.1".into(),
            vulnerable: true,
        };
        assert_eq!(should_invalidate(&m, &signal, "1.0.0"), Decision::Keep);
    }

    #[test]
    fn test_advisory_matches_dep_name_without_specifier() {
        let m = manifest(&["requests==2.31.0", "moviepy==1.0.3"], "1.0.0");
        let signal = Signal::Advisory {
            subject: "moviepy".into(),
        };
        assert_eq!(
            should_invalidate(&m, &signal, "1.0.0"),
            Decision::RegenerateSameFingerprint
        );
    }

    #[test]
    fn test_fixable_execution_failure_regenerates() {
        let m = manifest(&[], "1.0.0");
        assert_eq!(
            should_invalidate(&m, &Signal::ExecutionFailure { fixable: true }, "1.0.0"),
            Decision::RegenerateSameFingerprint
        );
        assert_eq!(
            should_invalidate(&m, &Signal::ExecutionFailure { fixable: false }, "1.0.0"),
            Decision::Keep
        );
    }

    #[test]
    fn test_template_major_bump_forces_new_identity() {
        let m = manifest(&["requests==2.31.0"], "1.0.0");
        let signal = Signal::ExecutionFailure { fixable: true };
        assert_eq!(
            should_invalidate(&m, &signal, "2.0.0"),
            Decision::RegenerateNewFingerprint
        );
        // Minor/patch bumps keep the same identity.
        assert_eq!(
            should_invalidate(&m, &signal, "1.7.3"),
            Decision::RegenerateSameFingerprint
        );
    }

    #[test]
    fn test_non_actionable_signal_keeps_entry_across_major_bump() {
        let m = manifest(&["requests==2.31.0"], "1.0.0");

        // Signals that would not regenerate under the same contract do not
        // start regenerating just because the template major moved on.
        assert_eq!(
            should_invalidate(&m, &Signal::ExecutionFailure { fixable: false }, "2.0.0"),
            Decision::Keep
        );
        assert_eq!(
            should_invalidate(
                &m,
                &Signal::DependencyDrift {
                    dependency: "requests".into(),
                    resolved: "2.32.0".into(),
                    vulnerable: false,
                },
                "2.0.0"
            ),
            Decision::Keep
        );
        assert_eq!(
            should_invalidate(
                &m,
                &Signal::Advisory {
                    subject: "moviepy".into()
                },
                "2.0.0"
            ),
            Decision::Keep
        );
    }
}
