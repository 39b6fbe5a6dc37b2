/// Generation client boundary
///
/// The remote backend that turns a prompt into script text is a classic
/// external dependency with non-deterministic output, so it is modelled
/// strictly as a trait: the HTTP implementation talks to the real service,
/// and the built-in template implementation substitutes for it offline and
/// in tests. Every candidate is verified here before it may be admitted to
/// the store.
pub mod http;
pub mod template;

pub use http::HttpGenerator;
pub use template::TemplateGenerator;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;

use crate::config::TemplateConfig;
use crate::error::{IncantError, Result};
use crate::sandbox::{parse_front_matter, validate_script, verify_against_manifest};
use crate::store::{content_sha, Manifest};

/// Request sent to the generation backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GenerationRequest {
    pub prompt: String,
    pub context: Value,
    pub language: String,
    pub template_version: String,
}

/// Candidate entry received from the backend. Not trusted until
/// [`verify_candidate`] passes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub manifest: Manifest,
    pub script: String,
    #[serde(default)]
    pub requirements: String,
    #[serde(default)]
    pub readme: String,
    /// Content hash the backend asserts for script + requirements.
    pub asserted_sha: String,
}

/// Interface to the generation backend. Implementations must be safe to call
/// concurrently; the caller guarantees per-fingerprint single-flight.
#[async_trait]
pub trait ScriptGenerator: Send + Sync {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate>;
}

/// Verify a candidate before admission to the store. Rejection is a
/// `Template` error: logged, surfaced, never cached.
pub fn verify_candidate(candidate: &Candidate, ceiling: &TemplateConfig) -> Result<()> {
    let recomputed = content_sha(&candidate.script, &candidate.requirements);

    if recomputed != candidate.asserted_sha {
        warn!(
            operation = "verify",
            status = "error",
            fingerprint = %candidate.manifest.fingerprint,
            "candidate hash mismatch"
        );
        return Err(IncantError::Template(format!(
            "asserted content hash {} does not match recomputed {}",
            candidate.asserted_sha, recomputed
        )));
    }

    if recomputed != candidate.manifest.content_sha {
        return Err(IncantError::Template(format!(
            "manifest content hash {} does not match recomputed {}",
            candidate.manifest.content_sha, recomputed
        )));
    }

    candidate.manifest.validate()?;

    // Front-matter and the security policy must already hold at admission
    // time, not just at execution time.
    let front = parse_front_matter(&candidate.script)?;
    verify_against_manifest(&front, &candidate.manifest)?;
    validate_script(&candidate.script, &candidate.manifest)?;

    enforce_capability_ceiling(&candidate.manifest, ceiling)
}

/// Reject manifests whose declared permissions are broader than the
/// template's capability ceiling.
fn enforce_capability_ceiling(manifest: &Manifest, ceiling: &TemplateConfig) -> Result<()> {
    if manifest.allow.network && !ceiling.allow_network {
        return Err(IncantError::Template(
            "candidate declares network access beyond the capability ceiling".into(),
        ));
    }

    for scope in &manifest.allow.fs {
        let within = ceiling.allowed_fs.iter().any(|allowed| {
            std::path::Path::new(scope).starts_with(std::path::Path::new(allowed))
        });
        if !within {
            return Err(IncantError::Template(format!(
                "candidate declares filesystem scope {scope:?} beyond the capability ceiling"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn ceiling() -> TemplateConfig {
        TemplateConfig {
            version: "1.0.0".into(),
            allow_network: true,
            allowed_fs: vec!["/tmp".into()],
        }
    }

    async fn sample_candidate() -> Candidate {
        let generator = TemplateGenerator::new();
        let request = GenerationRequest {
            prompt: "concatenate these videos".into(),
            context: json!({"inputs": ["a.mp4", "b.mp4"], "output": "final.mp4"}),
            language: "python".into(),
            template_version: "1.0.0".into(),
        };
        generator.generate(&request).await.unwrap()
    }

    #[tokio::test]
    async fn test_verify_accepts_wellformed_candidate() {
        let candidate = sample_candidate().await;
        verify_candidate(&candidate, &ceiling()).unwrap();
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_hash() {
        let mut candidate = sample_candidate().await;
        candidate.asserted_sha = "deadbeef".into();

        let err = verify_candidate(&candidate, &ceiling()).unwrap_err();
        assert!(matches!(err, IncantError::Template(_)));
    }

    #[tokio::test]
    async fn test_verify_rejects_tampered_script() {
        let mut candidate = sample_candidate().await;
        candidate.script.push_str("\nimport os\n");

        let err = verify_candidate(&candidate, &ceiling()).unwrap_err();
        assert!(matches!(err, IncantError::Template(_)));
    }

    #[tokio::test]
    async fn test_verify_rejects_dangerous_script() {
        let mut candidate = sample_candidate().await;
        candidate.script.push_str("\nimport os\nos.system(\"rm data\")\n");
        candidate.asserted_sha = content_sha(&candidate.script, &candidate.requirements);
        candidate.manifest.content_sha = candidate.asserted_sha.clone();

        let err = verify_candidate(&candidate, &ceiling()).unwrap_err();
        match err {
            IncantError::Template(msg) => assert!(msg.contains("security validation")),
            other => panic!("expected Template error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_verify_rejects_network_beyond_ceiling() {
        let generator = TemplateGenerator::new();
        let request = GenerationRequest {
            prompt: "fetch the item price from the api".into(),
            context: json!({"item_id": "MLA123"}),
            language: "python".into(),
            template_version: "1.0.0".into(),
        };
        let candidate = generator.generate(&request).await.unwrap();
        assert!(candidate.manifest.allow.network);

        let mut no_network = ceiling();
        no_network.allow_network = false;

        let err = verify_candidate(&candidate, &no_network).unwrap_err();
        assert!(matches!(err, IncantError::Template(_)));
    }

    #[tokio::test]
    async fn test_verify_rejects_fs_scope_beyond_ceiling() {
        let mut candidate = sample_candidate().await;
        candidate.manifest.allow.fs = vec!["/etc".into()];
        // Keep hashes coherent; the ceiling check is what must fire.
        let err = verify_candidate(&candidate, &ceiling()).unwrap_err();
        match err {
            IncantError::Template(msg) => assert!(msg.contains("filesystem scope")),
            other => panic!("expected Template error, got {other:?}"),
        }
    }
}
