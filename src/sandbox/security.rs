/// Static script validation
///
/// Scans Python artifact source before execution and before admission to the
/// store: known-dangerous call patterns are rejected outright, and every
/// import must come from the standard allow-list or be covered by a pinned
/// manifest dependency. Bash artifacts are covered by the runner's scope and
/// network enforcement instead.
use crate::error::{IncantError, Result};
use crate::store::Manifest;

/// Module roots importable without a matching dependency declaration.
const ALLOWED_IMPORTS: &[&str] = &[
    // Standard library
    "json", "sys", "os", "pathlib", "datetime", "time", "math", "random",
    "collections", "itertools", "functools", "operator", "re", "string",
    "urllib", "http", "base64", "hashlib", "uuid", "tempfile", "shutil",
    "zipfile", "tarfile", "csv", "xml", "html", "email", "logging",
    "subprocess", "threading", "multiprocessing", "queue", "socket",
    "ssl", "gzip", "bz2", "lzma", "pickle", "copy", "warnings",
    // Common data science libraries
    "numpy", "pandas", "matplotlib", "seaborn", "scipy", "sklearn",
    // Common web libraries
    "requests", "urllib3", "httpx",
    // Common video/image libraries
    "moviepy", "PIL", "opencv", "cv2",
    // Common file formats
    "yaml", "toml", "configparser", "argparse", "click",
];

/// Call sites that are never allowed, regardless of imports: dynamic code
/// execution, process control, and destructive filesystem operations.
const BLOCKED_CALLS: &[&str] = &[
    "__import__",
    "eval",
    "exec",
    "compile",
    "os.system",
    "os.popen",
    "os.fork",
    "os.kill",
    "os.remove",
    "os.unlink",
    "os.rmdir",
    "os.removedirs",
    "subprocess.run",
    "subprocess.Popen",
    "subprocess.call",
    "shutil.rmtree",
    "shutil.move",
    "shutil.copytree",
];

/// Validate artifact source against the security policy. All violations are
/// collected and reported together; any violation refuses execution.
pub fn validate_script(script: &str, manifest: &Manifest) -> Result<()> {
    if manifest.language != "python" {
        return Ok(());
    }

    let mut violations = Vec::new();

    for call in BLOCKED_CALLS {
        if contains_call(script, call) {
            violations.push(format!("blocked call: {call}"));
        }
    }

    for import in extract_imports(script) {
        if !import_allowed(&import, manifest) {
            violations.push(format!("import not allowed: {import}"));
        }
    }

    if violations.is_empty() {
        return Ok(());
    }
    Err(IncantError::Template(format!(
        "script failed security validation: {}",
        violations.join(", ")
    )))
}

/// Whether the script contains `name(` at a word boundary, tolerating
/// whitespace before the parenthesis.
fn contains_call(script: &str, name: &str) -> bool {
    let mut search_from = 0;
    while let Some(pos) = script[search_from..].find(name) {
        let start = search_from + pos;
        let end = start + name.len();
        search_from = start + 1;

        // Word boundary on the left: `myos.system(` is not `os.system(`.
        if start > 0 {
            let before = script.as_bytes()[start - 1] as char;
            if before.is_ascii_alphanumeric() || before == '_' || before == '.' {
                continue;
            }
        }

        let rest = script[end..].trim_start_matches([' ', '\t']);
        if rest.starts_with('(') {
            return true;
        }
    }
    false
}

/// Extract top-level module roots from `import` and `from` statements.
fn extract_imports(script: &str) -> Vec<String> {
    let mut roots = Vec::new();

    for line in script.lines() {
        let line = line.trim();

        if let Some(rest) = line.strip_prefix("import ") {
            for part in rest.split(',') {
                if let Some(name) = part.split_whitespace().next() {
                    push_root(&mut roots, name);
                }
            }
        } else if let Some(rest) = line.strip_prefix("from ") {
            if let Some(name) = rest.split_whitespace().next() {
                push_root(&mut roots, name);
            }
        }
    }

    roots
}

fn push_root(roots: &mut Vec<String>, name: &str) {
    let root = name.split('.').next().unwrap_or(name).to_string();
    if !root.is_empty() && !roots.contains(&root) {
        roots.push(root);
    }
}

fn import_allowed(root: &str, manifest: &Manifest) -> bool {
    if ALLOWED_IMPORTS.contains(&root) {
        return true;
    }

    // A pinned dependency covers the modules it provides.
    let lowered = root.to_lowercase();
    manifest
        .deps
        .iter()
        .any(|dep| dep.to_lowercase().contains(&lowered))
}
