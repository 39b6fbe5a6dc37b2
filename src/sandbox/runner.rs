/// Sandbox runner
///
/// Executes a cached artifact as a single subprocess in an isolated working
/// directory with a bounded wall-clock timeout, enforcing the manifest's
/// permissions before spawn. The final stdout line is parsed as the
/// structured execution result. The runner never mutates the cached entry.
use std::path::{Component, Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};

use super::frontmatter::{parse_front_matter, verify_against_manifest};
use crate::error::{CapturedOutput, IncantError, Result};
use crate::store::{CacheEntry, Permissions};

/// Context payloads above this size are passed as a file reference instead of
/// an inline argv string.
const INLINE_CONTEXT_LIMIT: usize = 64 * 1024;

/// Proxy sentinel exported when network access is denied: an unroutable
/// address that makes any proxy-aware HTTP stack fail fast.
const DENIED_PROXY: &str = "http://127.0.0.1:9";

const POLL_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ResultStatus {
    Ok,
    Error,
}

/// Structured result parsed from the artifact's final stdout line. Produced
/// fresh on every execution; never persisted as part of the cache identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub status: ResultStatus,
    pub artifacts: Vec<String>,
    pub output: serde_json::Map<String, Value>,
    pub raw: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone)]
pub struct ExecOptions {
    /// Wall-clock timeout for the artifact subprocess.
    pub timeout: Duration,
    /// Self-test mode: dependency and syntax/import validation without side
    /// effects.
    pub check_only: bool,
}

impl Default for ExecOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(300),
            check_only: false,
        }
    }
}

pub struct SandboxRunner {
    work_root: PathBuf,
    install_timeout: Duration,
}

impl SandboxRunner {
    pub fn new(work_root: impl Into<PathBuf>, install_timeout: Duration) -> Self {
        Self {
            work_root: work_root.into(),
            install_timeout,
        }
    }

    /// Execute a cached entry with the given context payload.
    pub fn execute(
        &self,
        entry: &CacheEntry,
        context: &Value,
        opts: &ExecOptions,
    ) -> Result<ExecutionResult> {
        let manifest = &entry.manifest;

        // Front-matter must be present and consistent with the manifest
        // before anything runs; the manifest is authoritative.
        let front = parse_front_matter(&entry.script)?;
        verify_against_manifest(&front, manifest)?;

        super::security::validate_script(&entry.script, manifest)?;

        enforce_fs_scopes(context, &manifest.allow)?;

        // Isolated per-execution working directory, never shared with the
        // host or other entries.
        std::fs::create_dir_all(&self.work_root)?;
        let exec_dir = tempfile::Builder::new()
            .prefix("incant-exec-")
            .tempdir_in(&self.work_root)?;

        let script_path = exec_dir.path().join(&manifest.entry);
        std::fs::write(&script_path, &entry.script)?;

        if !manifest.deps.is_empty() {
            self.install_dependencies(exec_dir.path(), &manifest.language, &manifest.deps)?;
        }

        let runtime = self.runtime_command(&manifest.language, exec_dir.path())?;

        if opts.check_only {
            return self.self_test(&runtime, &manifest.language, &script_path, exec_dir.path());
        }

        let mut cmd = Command::new(&runtime);
        cmd.arg(&script_path);
        cmd.arg(context_argument(context, exec_dir.path())?);
        cmd.current_dir(exec_dir.path());
        apply_permission_env(&mut cmd, &manifest.allow, exec_dir.path());

        debug!(
            operation = "execute",
            fingerprint = %manifest.fingerprint,
            runtime = %runtime.display(),
            "spawning artifact subprocess"
        );

        let start = Instant::now();
        let (captured, timed_out) = run_with_timeout(cmd, opts.timeout)
            .map_err(|err| IncantError::exec(format!("failed to spawn runtime: {err}")))?;

        if timed_out {
            warn!(
                operation = "execute",
                status = "error",
                fingerprint = %manifest.fingerprint,
                "execution timed out"
            );
            return Err(IncantError::Exec {
                reason: format!(
                    "execution timed out after {}s",
                    opts.timeout.as_secs()
                ),
                raw: captured,
            });
        }

        let mut result = parse_result_line(&captured)?;
        apply_aliases(&mut result, &manifest.aliases);

        info!(
            operation = "execute",
            status = match result.status {
                ResultStatus::Ok => "success",
                ResultStatus::Error => "error",
            },
            fingerprint = %manifest.fingerprint,
            duration_ms = start.elapsed().as_millis() as u64,
            "execution finished"
        );

        Ok(result)
    }

    /// Install declared dependencies into a runtime instance scoped to this
    /// execution. Install failures are retried once, then surfaced.
    fn install_dependencies(&self, exec_dir: &Path, language: &str, deps: &[String]) -> Result<()> {
        if language != "python" {
            return Err(IncantError::Dependency(format!(
                "dependency installation is not supported for language {language:?}"
            )));
        }

        let mut last_err = None;
        for attempt in 0..2 {
            match self.try_install(exec_dir, deps) {
                Ok(()) => return Ok(()),
                Err(err) => {
                    debug!(
                        operation = "install",
                        status = "error",
                        attempt,
                        "dependency install failed: {err}"
                    );
                    last_err = Some(err);
                }
            }
        }
        Err(last_err.expect("at least one install attempt"))
    }

    fn try_install(&self, exec_dir: &Path, deps: &[String]) -> Result<()> {
        let python = which::which("python3").unwrap_or_else(|_| PathBuf::from("python3"));
        let venv_dir = exec_dir.join("venv");

        let mut venv_cmd = Command::new(&python);
        venv_cmd.args(["-m", "venv"]).arg(&venv_dir);
        let (venv_out, _) = run_with_timeout(venv_cmd, self.install_timeout)
            .map_err(|err| IncantError::Dependency(format!("failed to create venv: {err}")))?;
        if venv_out.exit_code != Some(0) {
            return Err(IncantError::Dependency(format!(
                "venv creation failed: {}",
                venv_out.stderr.trim()
            )));
        }

        let mut pip_cmd = Command::new(venv_bin(&venv_dir).join("pip"));
        pip_cmd.arg("install").args(deps);
        pip_cmd.current_dir(exec_dir);
        let (pip_out, timed_out) = run_with_timeout(pip_cmd, self.install_timeout)
            .map_err(|err| IncantError::Dependency(format!("failed to run pip: {err}")))?;

        if timed_out {
            return Err(IncantError::Dependency(
                "dependency installation timed out".into(),
            ));
        }
        if pip_out.exit_code != Some(0) {
            return Err(IncantError::Dependency(format!(
                "pip install failed: {}",
                pip_out.stderr.trim()
            )));
        }
        Ok(())
    }

    /// Dependency and syntax/import validation without side effects.
    fn self_test(
        &self,
        runtime: &Path,
        language: &str,
        script_path: &Path,
        exec_dir: &Path,
    ) -> Result<ExecutionResult> {
        let mut cmd = Command::new(runtime);
        match language {
            "python" => {
                cmd.args(["-m", "py_compile"]).arg(script_path);
            }
            "bash" => {
                cmd.arg("-n").arg(script_path);
            }
            other => {
                return Err(IncantError::Validation(format!(
                    "unsupported language: {other:?}"
                )))
            }
        }
        cmd.current_dir(exec_dir);

        let (captured, _) = run_with_timeout(cmd, self.install_timeout)
            .map_err(|err| IncantError::exec(format!("failed to spawn runtime: {err}")))?;

        if captured.exit_code != Some(0) {
            return Err(IncantError::Exec {
                reason: "self-test failed".into(),
                raw: captured,
            });
        }

        let mut raw = serde_json::Map::new();
        raw.insert("mode".into(), Value::String("check".into()));
        Ok(ExecutionResult {
            status: ResultStatus::Ok,
            artifacts: Vec::new(),
            output: serde_json::Map::new(),
            raw,
        })
    }

    fn runtime_command(&self, language: &str, exec_dir: &Path) -> Result<PathBuf> {
        match language {
            "python" => {
                let venv_python = venv_bin(&exec_dir.join("venv")).join("python");
                if venv_python.exists() {
                    return Ok(venv_python);
                }
                Ok(which::which("python3").unwrap_or_else(|_| PathBuf::from("python3")))
            }
            "bash" => Ok(which::which("bash").unwrap_or_else(|_| PathBuf::from("bash"))),
            other => Err(IncantError::Validation(format!(
                "unsupported language: {other:?}"
            ))),
        }
    }
}

fn venv_bin(venv_dir: &Path) -> PathBuf {
    if cfg!(windows) {
        venv_dir.join("Scripts")
    } else {
        venv_dir.join("bin")
    }
}

/// Pass the context inline, or as a `@file` reference above the size limit.
fn context_argument(context: &Value, exec_dir: &Path) -> Result<String> {
    let payload = serde_json::to_string(context)?;
    if payload.len() <= INLINE_CONTEXT_LIMIT {
        return Ok(payload);
    }
    let context_path = exec_dir.join("context.json");
    std::fs::write(&context_path, payload)?;
    Ok(format!("@{}", context_path.display()))
}

fn apply_permission_env(cmd: &mut Command, allow: &Permissions, exec_dir: &Path) {
    cmd.env("INCANT_WORK_DIR", exec_dir);
    cmd.env("INCANT_NETWORK_ALLOWED", allow.network.to_string());
    cmd.env("INCANT_FS_SCOPES", allow.fs.join(":"));

    let venv = venv_bin(&exec_dir.join("venv"));
    if venv.exists() {
        let path = std::env::var_os("PATH").unwrap_or_default();
        let mut paths = vec![venv];
        paths.extend(std::env::split_paths(&path));
        if let Ok(joined) = std::env::join_paths(paths) {
            cmd.env("PATH", joined);
        }
    }

    let proxy_vars = [
        "HTTP_PROXY",
        "HTTPS_PROXY",
        "ALL_PROXY",
        "http_proxy",
        "https_proxy",
        "all_proxy",
    ];
    if allow.network {
        for var in proxy_vars {
            cmd.env_remove(var);
        }
    } else {
        // Pin every proxy variable to an unroutable address so an attempted
        // connection is blocked and reported rather than silently allowed.
        for var in proxy_vars {
            cmd.env(var, DENIED_PROXY);
        }
        cmd.env_remove("NO_PROXY");
        cmd.env_remove("no_proxy");
    }
}

/// Reject context values that escape the declared filesystem scopes before
/// the subprocess ever spawns: absolute paths outside any scope, and `..`
/// traversal that leaves the working directory.
fn enforce_fs_scopes(context: &Value, allow: &Permissions) -> Result<()> {
    let mut violations = Vec::new();
    collect_violations(context, allow, &mut violations);

    if violations.is_empty() {
        return Ok(());
    }
    Err(IncantError::exec(format!(
        "filesystem scope violation: {}",
        violations.join(", ")
    )))
}

fn collect_violations(value: &Value, allow: &Permissions, violations: &mut Vec<String>) {
    match value {
        Value::String(s) => {
            if path_escapes(s, allow) {
                violations.push(s.clone());
            }
        }
        Value::Array(items) => {
            for item in items {
                collect_violations(item, allow, violations);
            }
        }
        Value::Object(map) => {
            for val in map.values() {
                collect_violations(val, allow, violations);
            }
        }
        _ => {}
    }
}

fn path_escapes(s: &str, allow: &Permissions) -> bool {
    let path = Path::new(s);

    if path.is_absolute() {
        return !allow.fs.iter().any(|scope| {
            let scope = Path::new(scope);
            scope.is_absolute() && path.starts_with(scope)
        });
    }

    // Relative paths may contain `..` as long as they never climb above the
    // working directory.
    let mut depth: i32 = 0;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                depth -= 1;
                if depth < 0 {
                    return true;
                }
            }
            Component::Normal(_) => depth += 1,
            _ => {}
        }
    }
    false
}

fn run_with_timeout(mut cmd: Command, timeout: Duration) -> std::io::Result<(CapturedOutput, bool)> {
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());

    let mut child = cmd.spawn()?;

    // Drain both pipes while the process runs. A chatty artifact would
    // otherwise fill the pipe buffer, block on write, and hit the deadline
    // despite being fast.
    let stdout_reader = spawn_reader(child.stdout.take());
    let stderr_reader = spawn_reader(child.stderr.take());

    let start = Instant::now();
    let mut timed_out = false;

    loop {
        match child.try_wait()? {
            Some(_) => break,
            None => {
                if start.elapsed() >= timeout {
                    // Forcible termination; the failure surfaces to the
                    // caller, never retried automatically.
                    child.kill()?;
                    timed_out = true;
                    break;
                }
                std::thread::sleep(POLL_INTERVAL);
            }
        }
    }

    let status = child.wait()?;
    let stdout = stdout_reader.join().unwrap_or_default();
    let stderr = stderr_reader.join().unwrap_or_default();

    Ok((
        CapturedOutput {
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            exit_code: status.code(),
        },
        timed_out,
    ))
}

fn spawn_reader<R: std::io::Read + Send + 'static>(
    source: Option<R>,
) -> std::thread::JoinHandle<Vec<u8>> {
    std::thread::spawn(move || {
        let mut buf = Vec::new();
        if let Some(mut source) = source {
            let _ = source.read_to_end(&mut buf);
        }
        buf
    })
}

/// Parse the process's final stdout line as the structured result. Any other
/// shape is an execution error carrying the raw captured output.
fn parse_result_line(captured: &CapturedOutput) -> Result<ExecutionResult> {
    let line = captured
        .stdout
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty());

    let Some(line) = line else {
        return Err(IncantError::Exec {
            reason: match captured.exit_code {
                Some(0) => "no result line on stdout".into(),
                Some(code) => format!("process exited with code {code} and produced no result line"),
                None => "process terminated by signal without a result line".into(),
            },
            raw: captured.clone(),
        });
    };

    serde_json::from_str(line.trim()).map_err(|err| IncantError::Exec {
        reason: format!("unparseable result line: {err}"),
        raw: captured.clone(),
    })
}

/// Rename raw output field names to their canonical aliases.
fn apply_aliases(
    result: &mut ExecutionResult,
    aliases: &std::collections::BTreeMap<String, String>,
) {
    for (raw_name, canonical) in aliases {
        if let Some(value) = result.output.remove(raw_name) {
            result.output.insert(canonical.clone(), value);
        }
    }
}
