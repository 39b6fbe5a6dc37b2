/// Manifest model
///
/// The persisted metadata describing a cached artifact's identity,
/// permissions, and declared outputs. Owned exclusively by the artifact
/// store; immutable once written.
use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::{IncantError, Result};
use crate::fingerprint::Fingerprint;

/// Security permissions declared by an artifact. The manifest copy is
/// authoritative; the script front-matter is a secondary assertion that must
/// match.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Permissions {
    /// Whether the artifact may perform network I/O.
    #[serde(default)]
    pub network: bool,

    /// Filesystem scopes the artifact may touch beyond its working directory.
    #[serde(default)]
    pub fs: Vec<String>,

    /// Exclusive scopes: concurrent executions sharing a declared scope must
    /// serialize.
    #[serde(default)]
    pub exclusive: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub fingerprint: Fingerprint,
    pub prompt_sha: String,
    pub context_sha: String,
    pub language: String,
    pub entry: String,
    pub runtime: BTreeMap<String, String>,

    #[serde(default)]
    pub deps: Vec<String>,

    #[serde(default)]
    pub allow: Permissions,

    pub template_version: String,
    pub created_at: DateTime<Utc>,

    /// Expected output field types, e.g. `{"duration": "float"}`.
    #[serde(default)]
    pub outputs: BTreeMap<String, String>,

    /// Optional mapping from raw output field names to canonical names used
    /// by downstream field selection.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub aliases: BTreeMap<String, String>,

    /// Content hash over the artifact source and dependency declaration,
    /// recomputed and compared on every lookup.
    pub content_sha: String,
}

impl Manifest {
    /// Structural validation of a manifest before admission to the store.
    pub fn validate(&self) -> Result<()> {
        if self.entry.is_empty() {
            return Err(IncantError::Template("manifest entry point is empty".into()));
        }
        if self.language.is_empty() {
            return Err(IncantError::Template("manifest language is empty".into()));
        }
        if self.template_version.is_empty() {
            return Err(IncantError::Template(
                "manifest template_version is empty".into(),
            ));
        }
        if self.content_sha.is_empty() {
            return Err(IncantError::Template("manifest content_sha is empty".into()));
        }
        Ok(())
    }
}

/// Hash the cacheable content of an entry: artifact source plus dependency
/// declaration. The manifest itself is excluded so timestamps never affect
/// identity.
pub fn content_sha(script: &str, requirements: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(script.as_bytes());
    hasher.update([0u8]);
    hasher.update(requirements.as_bytes());
    hex::encode(hasher.finalize())
}
