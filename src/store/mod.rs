/// Fingerprint-addressed artifact store
///
/// One directory per fingerprint under the store root, holding the manifest,
/// artifact source, dependency declaration, and human-readable doc. Writes
/// assemble the full entry in a private staging directory and publish it with
/// a single atomic rename, so concurrent readers never observe a partially
/// written entry. Entries are superseded, never mutated: invalidation moves
/// the prior revision into `archive/` first.
pub mod manifest;

pub use manifest::{content_sha, Manifest, Permissions};

use std::fs;
use std::path::{Path, PathBuf};

use rand::Rng;
use tracing::{debug, info, warn};

use crate::error::{IncantError, Result};
use crate::fingerprint::Fingerprint;

const MANIFEST_FILE: &str = "manifest.json";
const REQUIREMENTS_FILE: &str = "requirements.txt";
const README_FILE: &str = "README.md";
const STAGING_DIR: &str = ".staging";
const ARCHIVE_DIR: &str = "archive";

/// A fully resolved cache entry, read on every cache hit.
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub manifest: Manifest,
    pub script: String,
    pub requirements: String,
    /// Directory the entry was published to.
    pub dir: PathBuf,
}

/// Content-addressed persistent cache. Process-wide shared state: pass a
/// handle explicitly, initialized on first access, torn down only by `clear`.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    /// Open the store, creating the root on first access.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(STAGING_DIR))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Look up an entry by fingerprint, verifying the recorded content hash
    /// against the recomputed one. A mismatch is a corruption error, never
    /// silently trusted.
    pub fn lookup(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>> {
        let dir = self.root.join(fp.as_str());
        let manifest_path = dir.join(MANIFEST_FILE);

        if !manifest_path.exists() {
            debug!(operation = "lookup", status = "miss", fingerprint = %fp, "cache miss");
            return Ok(None);
        }

        let manifest: Manifest = serde_json::from_str(&fs::read_to_string(&manifest_path)?)?;

        let script_path = dir.join(&manifest.entry);
        if !script_path.exists() {
            return Err(IncantError::Corruption {
                fingerprint: fp.to_string(),
                recorded: manifest.content_sha,
                actual: format!("missing artifact source {}", manifest.entry),
            });
        }
        let script = fs::read_to_string(&script_path)?;

        let requirements = match fs::read_to_string(dir.join(REQUIREMENTS_FILE)) {
            Ok(text) => text,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };

        let actual = content_sha(&script, &requirements);
        if actual != manifest.content_sha {
            warn!(
                operation = "lookup",
                status = "error",
                fingerprint = %fp,
                "content hash mismatch on lookup"
            );
            return Err(IncantError::Corruption {
                fingerprint: fp.to_string(),
                recorded: manifest.content_sha,
                actual,
            });
        }

        debug!(operation = "lookup", status = "hit", fingerprint = %fp, "cache hit");
        Ok(Some(CacheEntry {
            manifest,
            script,
            requirements,
            dir,
        }))
    }

    /// Publish a new entry. Fails with `Conflict` if an entry already exists
    /// under this fingerprint with different content; identical content is an
    /// idempotent no-op.
    pub fn put(
        &self,
        manifest: &Manifest,
        script: &str,
        requirements: &str,
        readme: &str,
    ) -> Result<()> {
        let fp = &manifest.fingerprint;
        let final_dir = self.root.join(fp.as_str());

        if final_dir.exists() {
            return self.check_existing(fp, &final_dir, &manifest.content_sha);
        }

        // Assemble the full entry in a private staging location.
        let staged = self.stage_dir(fp);
        fs::create_dir_all(&staged)?;

        let write = |name: &str, contents: &str| -> Result<()> {
            fs::write(staged.join(name), contents)?;
            Ok(())
        };
        write(&manifest.entry, script)?;
        if !requirements.is_empty() {
            write(REQUIREMENTS_FILE, requirements)?;
        }
        if !readme.is_empty() {
            write(README_FILE, readme)?;
        }
        write(MANIFEST_FILE, &serde_json::to_string_pretty(manifest)?)?;

        // Single atomic publish. A concurrent writer that got there first
        // makes the rename fail; fall back to the conflict check.
        match fs::rename(&staged, &final_dir) {
            Ok(()) => {
                info!(
                    operation = "put",
                    status = "success",
                    fingerprint = %fp,
                    size_bytes = script.len(),
                    "entry published"
                );
                Ok(())
            }
            Err(_) if final_dir.exists() => {
                let _ = fs::remove_dir_all(&staged);
                self.check_existing(fp, &final_dir, &manifest.content_sha)
            }
            Err(err) => {
                let _ = fs::remove_dir_all(&staged);
                Err(err.into())
            }
        }
    }

    /// List all cached fingerprints, sorted.
    pub fn list(&self) -> Result<Vec<Fingerprint>> {
        let mut fingerprints = Vec::new();

        if !self.root.exists() {
            return Ok(fingerprints);
        }

        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if !entry.file_type()?.is_dir() {
                continue;
            }
            if let Some(name) = entry.file_name().to_str() {
                // Staging and archive directories are not entries.
                if let Ok(fp) = name.parse::<Fingerprint>() {
                    fingerprints.push(fp);
                }
            }
        }

        fingerprints.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        Ok(fingerprints)
    }

    /// Move an entry into the archive, retaining it for reproducible re-runs
    /// against older revisions. The fingerprint becomes a miss afterwards.
    pub fn archive(&self, fp: &Fingerprint) -> Result<()> {
        let dir = self.root.join(fp.as_str());
        if !dir.exists() {
            return Err(IncantError::Validation(format!(
                "no cache entry for fingerprint {fp}"
            )));
        }

        let archive_root = self.root.join(ARCHIVE_DIR);
        fs::create_dir_all(&archive_root)?;

        let dest = archive_root.join(format!(
            "{}-{}",
            fp,
            chrono::Utc::now().timestamp_millis()
        ));
        fs::rename(&dir, &dest)?;

        info!(operation = "archive", status = "success", fingerprint = %fp, "entry archived");
        Ok(())
    }

    /// Explicit teardown: remove every entry (including archives) and
    /// recreate the empty root.
    pub fn clear(&self) -> Result<()> {
        if self.root.exists() {
            fs::remove_dir_all(&self.root)?;
        }
        fs::create_dir_all(self.root.join(STAGING_DIR))?;
        info!(operation = "clear", status = "success", "store cleared");
        Ok(())
    }

    fn check_existing(&self, fp: &Fingerprint, dir: &Path, incoming_sha: &str) -> Result<()> {
        let manifest: Manifest =
            serde_json::from_str(&fs::read_to_string(dir.join(MANIFEST_FILE))?)?;

        if manifest.content_sha == incoming_sha {
            debug!(operation = "put", status = "success", fingerprint = %fp, "identical entry already published");
            return Ok(());
        }

        warn!(
            operation = "put",
            status = "error",
            fingerprint = %fp,
            "refusing to overwrite entry with different content"
        );
        Err(IncantError::Conflict {
            fingerprint: fp.to_string(),
            existing: manifest.content_sha,
            incoming: incoming_sha.to_string(),
        })
    }

    fn stage_dir(&self, fp: &Fingerprint) -> PathBuf {
        let nonce: u64 = rand::rng().random();
        self.root.join(STAGING_DIR).join(format!(
            "{}.{}.{:x}",
            fp,
            std::process::id(),
            nonce
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn make_manifest(prompt: &str, script: &str, requirements: &str) -> Manifest {
        let context = json!({});
        Manifest {
            fingerprint: crate::fingerprint::fingerprint(prompt, &context, "python", "1.0.0")
                .unwrap(),
            prompt_sha: crate::fingerprint::prompt_sha(prompt),
            context_sha: crate::fingerprint::context_sha(&context).unwrap(),
            language: "python".into(),
            entry: "script.py".into(),
            runtime: BTreeMap::from([("python".to_string(), "3.11".to_string())]),
            deps: vec![],
            allow: Permissions::default(),
            template_version: "1.0.0".into(),
            created_at: Utc::now(),
            outputs: BTreeMap::new(),
            aliases: BTreeMap::new(),
            content_sha: content_sha(script, requirements),
        }
    }

    #[test]
    fn test_put_and_lookup() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task one", "print('hello')", "");
        store.put(&manifest, "print('hello')", "", "# doc").unwrap();

        let entry = store.lookup(&manifest.fingerprint).unwrap().unwrap();
        assert_eq!(entry.manifest, manifest);
        assert_eq!(entry.script, "print('hello')");
        assert!(entry.dir.join("README.md").exists());
    }

    #[test]
    fn test_lookup_miss() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let fp = crate::fingerprint::fingerprint("absent", &json!({}), "python", "1.0.0").unwrap();
        assert!(store.lookup(&fp).unwrap().is_none());
    }

    #[test]
    fn test_put_idempotent_for_identical_content() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task", "print(1)", "");
        store.put(&manifest, "print(1)", "", "").unwrap();
        store.put(&manifest, "print(1)", "", "").unwrap();
        assert_eq!(store.list().unwrap().len(), 1);
    }

    #[test]
    fn test_put_conflict_on_different_content() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task", "print(1)", "");
        store.put(&manifest, "print(1)", "", "").unwrap();

        let mut other = manifest.clone();
        other.content_sha = content_sha("print(2)", "");
        let err = store.put(&other, "print(2)", "", "").unwrap_err();
        assert!(matches!(err, IncantError::Conflict { .. }));

        // Original entry untouched.
        let entry = store.lookup(&manifest.fingerprint).unwrap().unwrap();
        assert_eq!(entry.script, "print(1)");
    }

    #[test]
    fn test_lookup_detects_corruption() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task", "print(1)", "");
        store.put(&manifest, "print(1)", "", "").unwrap();

        // Tamper with the published artifact.
        let script_path = temp
            .path()
            .join("scripts")
            .join(manifest.fingerprint.as_str())
            .join("script.py");
        fs::write(&script_path, "print('tampered')").unwrap();

        let err = store.lookup(&manifest.fingerprint).unwrap_err();
        assert!(matches!(err, IncantError::Corruption { .. }));
    }

    #[test]
    fn test_list_skips_staging_and_archive() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let a = make_manifest("task a", "print('a')", "");
        let b = make_manifest("task b", "print('b')", "");
        store.put(&a, "print('a')", "", "").unwrap();
        store.put(&b, "print('b')", "", "").unwrap();

        store.archive(&a.fingerprint).unwrap();

        let listed = store.list().unwrap();
        assert_eq!(listed, vec![b.fingerprint.clone()]);
    }

    #[test]
    fn test_archive_retains_entry_and_misses_afterwards() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task", "print(1)", "");
        store.put(&manifest, "print(1)", "", "").unwrap();
        store.archive(&manifest.fingerprint).unwrap();

        assert!(store.lookup(&manifest.fingerprint).unwrap().is_none());

        // The prior revision still exists under archive/.
        let archived: Vec<_> = fs::read_dir(temp.path().join("scripts").join("archive"))
            .unwrap()
            .collect();
        assert_eq!(archived.len(), 1);
    }

    #[test]
    fn test_archive_missing_entry_is_validation_error() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let fp = crate::fingerprint::fingerprint("absent", &json!({}), "python", "1.0.0").unwrap();
        assert!(matches!(
            store.archive(&fp),
            Err(IncantError::Validation(_))
        ));
    }

    #[test]
    fn test_clear_recreates_empty_root() {
        let temp = TempDir::new().unwrap();
        let store = ArtifactStore::open(temp.path().join("scripts")).unwrap();

        let manifest = make_manifest("task", "print(1)", "");
        store.put(&manifest, "print(1)", "", "").unwrap();
        store.clear().unwrap();

        assert!(store.list().unwrap().is_empty());
        assert!(store.root().exists());
    }
}
