/// Client orchestrator
///
/// Ties the fingerprint engine, artifact store, generation client, and
/// sandbox runner together behind one handle. Guarantees per-fingerprint
/// single-flight generation and serializes executions that declare exclusive
/// scopes.
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::Value;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tracing::{debug, info};

use crate::config::IncantConfig;
use crate::error::{IncantError, Result};
use crate::fingerprint::{self, Fingerprint};
use crate::generate::{
    verify_candidate, GenerationRequest, HttpGenerator, ScriptGenerator, TemplateGenerator,
};
use crate::invalidate::{should_invalidate, Decision, Signal};
use crate::sandbox::{ExecOptions, ExecutionResult, SandboxRunner};
use crate::store::{ArtifactStore, CacheEntry, Manifest};

type KeyedLocks<K> = Mutex<HashMap<K, Arc<AsyncMutex<()>>>>;

/// Options for a resolve-and-run request.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub language: String,
    /// Archive any existing entry first and regenerate.
    pub refresh: bool,
    /// Restrict the result's output map to these fields.
    pub select: Vec<String>,
    /// Self-test mode: validate without side effects.
    pub check_only: bool,
    /// Override the configured execution timeout.
    pub timeout: Option<Duration>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            language: "python".to_string(),
            refresh: false,
            select: Vec::new(),
            check_only: false,
            timeout: None,
        }
    }
}

/// Outcome of a resolve-and-run request.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub fingerprint: Fingerprint,
    /// Whether the artifact came from the cache rather than fresh generation.
    pub cache_hit: bool,
    pub result: ExecutionResult,
}

pub struct Incant {
    config: IncantConfig,
    store: Arc<ArtifactStore>,
    generator: Arc<dyn ScriptGenerator>,
    runner: Arc<SandboxRunner>,
    /// Per-fingerprint generation locks. Waiters re-check the store after
    /// acquiring, so N concurrent misses produce one generation.
    flights: KeyedLocks<Fingerprint>,
    /// Per-scope execution locks for entries declaring exclusivity.
    scope_locks: KeyedLocks<String>,
}

impl Incant {
    pub fn new(config: IncantConfig) -> Result<Self> {
        let generator: Arc<dyn ScriptGenerator> = match &config.generator.url {
            Some(url) => Arc::new(HttpGenerator::new(url.clone(), &config.generator)?),
            None => Arc::new(TemplateGenerator::new()),
        };
        Self::with_generator(config, generator)
    }

    /// Construct with an explicit generation backend.
    pub fn with_generator(
        config: IncantConfig,
        generator: Arc<dyn ScriptGenerator>,
    ) -> Result<Self> {
        let store = Arc::new(ArtifactStore::open(&config.store.dir)?);
        let work_root = config
            .sandbox
            .work_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| std::env::temp_dir().join("incant"));
        let runner = Arc::new(SandboxRunner::new(
            work_root,
            config.sandbox.install_timeout(),
        ));

        Ok(Self {
            config,
            store,
            generator,
            runner,
            flights: Mutex::new(HashMap::new()),
            scope_locks: Mutex::new(HashMap::new()),
        })
    }

    pub fn store(&self) -> &ArtifactStore {
        &self.store
    }

    /// Resolve a request to a cached artifact (generating on a miss) and
    /// execute it with the given context.
    pub async fn run(&self, prompt: &str, context: &Value, opts: &RunOptions) -> Result<RunOutcome> {
        let template_version = self.config.template.version.clone();
        let fp = fingerprint::fingerprint(prompt, context, &opts.language, &template_version)?;

        let (entry, cache_hit) = self.resolve(&fp, prompt, context, opts).await?;
        let mut result = self.execute_entry(&entry, context, opts).await?;

        if !opts.select.is_empty() {
            select_fields(&mut result, &opts.select)?;
        }

        Ok(RunOutcome {
            fingerprint: fp,
            cache_hit,
            result,
        })
    }

    /// Resolve the fingerprint to a cache entry, generating under a
    /// per-fingerprint lock on a miss. If the generating task is cancelled,
    /// the lock releases and the next waiter takes over.
    async fn resolve(
        &self,
        fp: &Fingerprint,
        prompt: &str,
        context: &Value,
        opts: &RunOptions,
    ) -> Result<(CacheEntry, bool)> {
        let flight = self.keyed_lock(&self.flights, fp.clone());
        let resolved = {
            let _guard = flight.lock().await;
            self.resolve_locked(fp, prompt, context, opts).await
        };
        evict_idle_lock(&self.flights, fp, flight);
        resolved
    }

    async fn resolve_locked(
        &self,
        fp: &Fingerprint,
        prompt: &str,
        context: &Value,
        opts: &RunOptions,
    ) -> Result<(CacheEntry, bool)> {
        if opts.refresh {
            if self.store.lookup(fp)?.is_some() {
                info!(operation = "resolve", fingerprint = %fp, "refresh requested, archiving entry");
                self.store.archive(fp)?;
            }
        } else if let Some(entry) = self.store.lookup(fp)? {
            return Ok((entry, true));
        }

        debug!(operation = "resolve", status = "miss", fingerprint = %fp, "generating artifact");
        let request = GenerationRequest {
            prompt: prompt.to_string(),
            context: context.clone(),
            language: opts.language.clone(),
            template_version: self.config.template.version.clone(),
        };
        let candidate = self.generator.generate(&request).await?;

        if candidate.manifest.fingerprint != *fp {
            return Err(IncantError::Template(format!(
                "backend returned fingerprint {} for request {}",
                candidate.manifest.fingerprint, fp
            )));
        }
        verify_candidate(&candidate, &self.config.template)?;

        self.store.put(
            &candidate.manifest,
            &candidate.script,
            &candidate.requirements,
            &candidate.readme,
        )?;

        let entry = self.store.lookup(fp)?.ok_or_else(|| {
            IncantError::Corruption {
                fingerprint: fp.to_string(),
                recorded: candidate.manifest.content_sha.clone(),
                actual: "entry vanished after publish".into(),
            }
        })?;
        Ok((entry, false))
    }

    async fn execute_entry(
        &self,
        entry: &CacheEntry,
        context: &Value,
        opts: &RunOptions,
    ) -> Result<ExecutionResult> {
        let (scope_keys, scope_guards) = self.acquire_scopes(&entry.manifest).await;

        let exec_opts = ExecOptions {
            timeout: opts.timeout.unwrap_or_else(|| self.config.sandbox.timeout()),
            check_only: opts.check_only,
        };

        let runner = Arc::clone(&self.runner);
        let entry = entry.clone();
        let context = context.clone();
        let result = tokio::task::spawn_blocking(move || runner.execute(&entry, &context, &exec_opts))
            .await
            .map_err(|err| IncantError::exec(format!("execution task failed: {err}")));

        drop(scope_guards);
        for key in &scope_keys {
            evict_idle_lock(&self.scope_locks, key, self.keyed_lock(&self.scope_locks, key.clone()));
        }

        result?
    }

    /// Acquire execution locks for an entry declaring exclusive scopes.
    /// Scopes are locked in sorted order; entries without filesystem scopes
    /// serialize on a single global key.
    async fn acquire_scopes(&self, manifest: &Manifest) -> (Vec<String>, Vec<OwnedMutexGuard<()>>) {
        if !manifest.allow.exclusive {
            return (Vec::new(), Vec::new());
        }

        let mut keys: Vec<String> = if manifest.allow.fs.is_empty() {
            vec![String::from("*")]
        } else {
            manifest.allow.fs.clone()
        };
        keys.sort();
        keys.dedup();

        let mut guards = Vec::with_capacity(keys.len());
        for key in &keys {
            let lock = self.keyed_lock(&self.scope_locks, key.clone());
            guards.push(lock.lock_owned().await);
        }
        (keys, guards)
    }

    fn keyed_lock<K: std::hash::Hash + Eq + Clone>(
        &self,
        locks: &KeyedLocks<K>,
        key: K,
    ) -> Arc<AsyncMutex<()>> {
        let mut map = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        Arc::clone(map.entry(key).or_default())
    }

    /// List manifests for all cached entries, sorted by fingerprint.
    pub fn list_entries(&self) -> Result<Vec<Manifest>> {
        let mut manifests = Vec::new();
        for fp in self.store.list()? {
            if let Some(entry) = self.store.lookup(&fp)? {
                manifests.push(entry.manifest);
            }
        }
        Ok(manifests)
    }

    pub fn get_entry(&self, fp: &Fingerprint) -> Result<Option<CacheEntry>> {
        self.store.lookup(fp)
    }

    pub fn clear_store(&self) -> Result<()> {
        self.store.clear()
    }

    /// Apply an invalidation signal to a cached entry. A same-identity
    /// regeneration archives the entry so the next resolve misses; a
    /// new-identity decision retains it for requests still pinned to the old
    /// contract.
    pub fn apply_signal(&self, fp: &Fingerprint, signal: &Signal) -> Result<Decision> {
        let Some(entry) = self.store.lookup(fp)? else {
            return Err(IncantError::Validation(format!(
                "no cache entry for fingerprint {fp}"
            )));
        };

        let decision = should_invalidate(&entry.manifest, signal, &self.config.template.version);
        info!(
            operation = "invalidate",
            fingerprint = %fp,
            decision = ?decision,
            "invalidation signal applied"
        );

        if decision == Decision::RegenerateSameFingerprint {
            self.store.archive(fp)?;
        }
        Ok(decision)
    }
}

/// Drop a caller's handle on a keyed lock and remove the map entry once no
/// other task holds or awaits it, so the maps stay bounded by in-flight work.
fn evict_idle_lock<K: std::hash::Hash + Eq>(
    locks: &KeyedLocks<K>,
    key: &K,
    handle: Arc<AsyncMutex<()>>,
) {
    let mut map = locks.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    drop(handle);
    if map.get(key).is_some_and(|lock| Arc::strong_count(lock) == 1) {
        map.remove(key);
    }
}

/// Restrict a result's output map to the requested fields. Requesting a field
/// the artifact did not produce is an error, not a silent omission.
fn select_fields(result: &mut ExecutionResult, fields: &[String]) -> Result<()> {
    let mut selected = serde_json::Map::new();
    for field in fields {
        match result.output.remove(field) {
            Some(value) => {
                selected.insert(field.clone(), value);
            }
            None => {
                return Err(IncantError::Validation(format!(
                    "selected field {field:?} not present in result output"
                )))
            }
        }
    }
    result.output = selected;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sandbox::ResultStatus;
    use serde_json::json;
    use tempfile::TempDir;

    fn test_client(temp: &TempDir) -> Incant {
        let mut config = IncantConfig::default();
        config.store.dir = temp
            .path()
            .join("scripts")
            .to_string_lossy()
            .into_owned();
        config.sandbox.work_dir = Some(temp.path().join("work").to_string_lossy().into_owned());
        Incant::new(config).unwrap()
    }

    fn bash_opts() -> RunOptions {
        RunOptions {
            language: "bash".into(),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_miss_then_hit() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);
        let context = json!({"name": "world"});

        let first = client
            .run("echo the context", &context, &bash_opts())
            .await
            .unwrap();
        assert!(!first.cache_hit);
        assert_eq!(first.result.status, ResultStatus::Ok);
        assert_eq!(first.result.output["echo"], context);

        let second = client
            .run("echo the context", &context, &bash_opts())
            .await
            .unwrap();
        assert!(second.cache_hit);
        assert_eq!(second.fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn test_refresh_regenerates() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);
        let context = json!({});

        let first = client
            .run("echo the context", &context, &bash_opts())
            .await
            .unwrap();

        let opts = RunOptions {
            refresh: true,
            ..bash_opts()
        };
        let refreshed = client.run("echo the context", &context, &opts).await.unwrap();
        assert!(!refreshed.cache_hit);
        assert_eq!(refreshed.fingerprint, first.fingerprint);
    }

    #[tokio::test]
    async fn test_select_filters_output() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        let opts = RunOptions {
            select: vec!["echo".into()],
            ..bash_opts()
        };
        let outcome = client
            .run("echo the context", &json!({"k": 1}), &opts)
            .await
            .unwrap();
        assert_eq!(outcome.result.output.len(), 1);

        let opts = RunOptions {
            select: vec!["missing".into()],
            ..bash_opts()
        };
        let err = client
            .run("echo the context", &json!({"k": 1}), &opts)
            .await
            .unwrap_err();
        assert!(matches!(err, IncantError::Validation(_)));
    }

    #[tokio::test]
    async fn test_apply_signal_archives_on_same_identity_regeneration() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        let outcome = client
            .run("echo the context", &json!({}), &bash_opts())
            .await
            .unwrap();

        let decision = client
            .apply_signal(
                &outcome.fingerprint,
                &Signal::ExecutionFailure { fixable: true },
            )
            .unwrap();
        assert_eq!(decision, Decision::RegenerateSameFingerprint);
        assert!(client.get_entry(&outcome.fingerprint).unwrap().is_none());
    }

    #[tokio::test]
    async fn test_apply_signal_keep_leaves_entry() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        let outcome = client
            .run("echo the context", &json!({}), &bash_opts())
            .await
            .unwrap();

        let decision = client
            .apply_signal(
                &outcome.fingerprint,
                &Signal::ExecutionFailure { fixable: false },
            )
            .unwrap();
        assert_eq!(decision, Decision::Keep);
        assert!(client.get_entry(&outcome.fingerprint).unwrap().is_some());
    }

    #[tokio::test]
    async fn test_keyed_locks_do_not_accumulate() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        client
            .run("echo the context", &json!({"a": 1}), &bash_opts())
            .await
            .unwrap();
        client
            .run("echo something else entirely", &json!({"b": 2}), &bash_opts())
            .await
            .unwrap();

        assert!(client.flights.lock().unwrap().is_empty());
        assert!(client.scope_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_exclusive_scope_lock_released_and_evicted() {
        use crate::store::{content_sha, Permissions};
        use std::collections::BTreeMap;

        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        let prompt = "touch the shared workspace";
        let context = json!({});
        let script = "\
# --- INCANT ---\n\
# language: bash\n\
# entry: script.sh\n\
# deps: \n\
# network: false\n\
# template_version: 1.0.0\n\
# --- /INCANT ---\n\n\
printf '{\"status\":\"ok\",\"artifacts\":[],\"output\":{},\"raw\":{}}\\n'\n";

        let manifest = crate::store::Manifest {
            fingerprint: fingerprint::fingerprint(prompt, &context, "bash", "1.0.0").unwrap(),
            prompt_sha: fingerprint::prompt_sha(prompt),
            context_sha: fingerprint::context_sha(&context).unwrap(),
            language: "bash".into(),
            entry: "script.sh".into(),
            runtime: BTreeMap::new(),
            deps: vec![],
            allow: Permissions {
                network: false,
                fs: vec![],
                exclusive: true,
            },
            template_version: "1.0.0".into(),
            created_at: chrono::Utc::now(),
            outputs: BTreeMap::new(),
            aliases: BTreeMap::new(),
            content_sha: content_sha(script, ""),
        };
        client.store().put(&manifest, script, "", "").unwrap();

        let outcome = client.run(prompt, &context, &bash_opts()).await.unwrap();
        assert!(outcome.cache_hit);
        assert_eq!(outcome.result.status, ResultStatus::Ok);

        // The exclusive execution lock is not retained after the run.
        assert!(client.scope_locks.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_and_clear() {
        let temp = TempDir::new().unwrap();
        let client = test_client(&temp);

        client
            .run("echo the context", &json!({"a": 1}), &bash_opts())
            .await
            .unwrap();
        client
            .run("echo something else entirely", &json!({"b": 2}), &bash_opts())
            .await
            .unwrap();

        assert_eq!(client.list_entries().unwrap().len(), 2);
        client.clear_store().unwrap();
        assert!(client.list_entries().unwrap().is_empty());
    }
}
