/// Fingerprint engine
///
/// Derives a deterministic identity for a (request, context, language,
/// template-major-version) tuple. Total function, no I/O; the only failure
/// mode is a malformed context (`Validation`).
pub mod normalize;

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IncantError, Result};

pub use normalize::{normalize_context, normalize_prompt};

/// Number of hex characters in a fingerprint (64 bits).
pub const FINGERPRINT_LEN: usize = 16;

/// Opaque cache identity. Directory names in the store equal the fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for Fingerprint {
    type Err = IncantError;

    fn from_str(s: &str) -> Result<Self> {
        if s.len() != FINGERPRINT_LEN || !s.chars().all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()) {
            return Err(IncantError::Validation(format!(
                "invalid fingerprint: {s:?} (expected {FINGERPRINT_LEN} lowercase hex chars)"
            )));
        }
        Ok(Fingerprint(s.to_string()))
    }
}

/// Compute the fingerprint for a request in strict mode: any structural
/// difference in the normalized context produces a distinct identity.
pub fn fingerprint(
    prompt: &str,
    context: &serde_json::Value,
    language: &str,
    template_version: &str,
) -> Result<Fingerprint> {
    let prompt_norm = normalize_prompt(prompt);
    let context_norm = normalize_context(context)?;

    let mut hasher = Sha256::new();
    hasher.update(prompt_norm.as_bytes());
    hasher.update([0u8]);
    hasher.update(context_norm.as_bytes());
    hasher.update([0u8]);
    hasher.update(language.as_bytes());
    hasher.update([0u8]);
    hasher.update(major_version(template_version).as_bytes());

    let hash = hex::encode(hasher.finalize());
    Ok(Fingerprint(hash[..FINGERPRINT_LEN].to_string()))
}

/// Hash of the normalized prompt, recorded in the manifest.
pub fn prompt_sha(prompt: &str) -> String {
    short_sha(normalize_prompt(prompt).as_bytes())
}

/// Hash of the normalized context, recorded in the manifest.
pub fn context_sha(context: &serde_json::Value) -> Result<String> {
    Ok(short_sha(normalize_context(context)?.as_bytes()))
}

/// Extract the major component of a template version. A major-version change
/// in the generation contract forces a new fingerprint; minor/patch do not.
pub fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

fn short_sha(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())[..FINGERPRINT_LEN].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_fingerprint_deterministic() {
        let ctx = json!({"inputs": ["a.mp4", "b.mp4"], "output": "final.mp4"});
        let a = fingerprint("Concatenate these videos", &ctx, "python", "1.0.0").unwrap();
        let b = fingerprint("Concatenate these videos", &ctx, "python", "1.0.0").unwrap();
        assert_eq!(a, b);
        assert_eq!(a.as_str().len(), FINGERPRINT_LEN);
    }

    #[test]
    fn test_fingerprint_key_order_independent() {
        let a = fingerprint(
            "Concatenate these videos",
            &json!({"inputs": ["a.mp4", "b.mp4"], "output": "final.mp4"}),
            "python",
            "1.0.0",
        )
        .unwrap();
        let b = fingerprint(
            "Concatenate these videos",
            &json!({"output": "final.mp4", "inputs": ["a.mp4", "b.mp4"]}),
            "python",
            "1.0.0",
        )
        .unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_fingerprint_sensitive_to_context_bytes() {
        let a = fingerprint("task", &json!({"path": "data/in"}), "python", "1.0.0").unwrap();
        let b = fingerprint("task", &json!({"path": "data/in "}), "python", "1.0.0").unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn test_fingerprint_sensitive_to_language_and_major() {
        let ctx = json!({});
        let base = fingerprint("task", &ctx, "python", "1.0.0").unwrap();
        assert_ne!(base, fingerprint("task", &ctx, "bash", "1.0.0").unwrap());
        assert_ne!(base, fingerprint("task", &ctx, "python", "2.0.0").unwrap());
        // Minor/patch bumps do not change identity.
        assert_eq!(base, fingerprint("task", &ctx, "python", "1.4.2").unwrap());
    }

    #[test]
    fn test_fingerprint_parse_roundtrip() {
        let fp = fingerprint("task", &json!({}), "python", "1.0.0").unwrap();
        let parsed: Fingerprint = fp.as_str().parse().unwrap();
        assert_eq!(fp, parsed);

        assert!("not-a-fingerprint".parse::<Fingerprint>().is_err());
        assert!("ABCDEF0123456789".parse::<Fingerprint>().is_err());
    }

    #[test]
    fn test_major_version() {
        assert_eq!(major_version("1.0.0"), "1");
        assert_eq!(major_version("2.13.4"), "2");
        assert_eq!(major_version("3"), "3");
    }
}
