/// Artifact front-matter contract
///
/// Every stored script begins with a delimited header block:
///
/// ```text
/// # --- INCANT ---
/// # language: python
/// # entry: script.py
/// # deps: moviepy==1.0.3, requests==2.31.0
/// # network: false
/// # template_version: 1.0.0
/// # --- /INCANT ---
/// ```
///
/// The runner reads this block before execution. The manifest is
/// authoritative; the front-matter is a secondary assertion that must match,
/// failing closed on mismatch.
use crate::error::{IncantError, Result};
use crate::store::Manifest;

const BLOCK_OPEN: &str = "--- INCANT ---";
const BLOCK_CLOSE: &str = "--- /INCANT ---";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrontMatter {
    pub language: String,
    pub entry: String,
    pub deps: Vec<String>,
    pub network: bool,
    pub template_version: String,
}

/// Parse the front-matter block from a script. A shebang line before the
/// block is allowed; anything else is not.
pub fn parse_front_matter(script: &str) -> Result<FrontMatter> {
    let mut lines = script.lines().peekable();

    if let Some(first) = lines.peek() {
        if first.starts_with("#!") {
            lines.next();
        }
    }

    match lines.next().map(strip_comment) {
        Some(Some(marker)) if marker == BLOCK_OPEN => {}
        _ => {
            return Err(IncantError::Template(
                "script is missing the front-matter block".into(),
            ))
        }
    }

    let mut language = None;
    let mut entry = None;
    let mut deps = None;
    let mut network = None;
    let mut template_version = None;
    let mut closed = false;

    for line in lines {
        let Some(directive) = strip_comment(line) else {
            break; // non-comment line before the closing marker
        };

        if directive == BLOCK_CLOSE {
            closed = true;
            break;
        }

        let Some((key, value)) = directive.split_once(':') else {
            return Err(IncantError::Template(format!(
                "malformed front-matter line: {line:?}"
            )));
        };
        let value = value.trim();

        match key.trim() {
            "language" => language = Some(value.to_string()),
            "entry" => entry = Some(value.to_string()),
            "deps" => {
                deps = Some(
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|d| !d.is_empty())
                        .map(str::to_string)
                        .collect::<Vec<_>>(),
                )
            }
            "network" => {
                network = Some(value.parse::<bool>().map_err(|_| {
                    IncantError::Template(format!("invalid network declaration: {value:?}"))
                })?)
            }
            "template_version" => template_version = Some(value.to_string()),
            other => {
                return Err(IncantError::Template(format!(
                    "unknown front-matter field: {other:?}"
                )))
            }
        }
    }

    if !closed {
        return Err(IncantError::Template(
            "front-matter block is not closed".into(),
        ));
    }

    let require = |field: Option<String>, name: &str| {
        field.ok_or_else(|| IncantError::Template(format!("front-matter missing field {name:?}")))
    };

    Ok(FrontMatter {
        language: require(language, "language")?,
        entry: require(entry, "entry")?,
        deps: deps
            .ok_or_else(|| IncantError::Template("front-matter missing field \"deps\"".into()))?,
        network: network
            .ok_or_else(|| IncantError::Template("front-matter missing field \"network\"".into()))?,
        template_version: require(template_version, "template_version")?,
    })
}

/// Verify the front-matter assertion against the authoritative manifest.
pub fn verify_against_manifest(front: &FrontMatter, manifest: &Manifest) -> Result<()> {
    let mismatch = |field: &str, asserted: &str, recorded: &str| {
        Err(IncantError::Template(format!(
            "front-matter {field} ({asserted}) does not match manifest ({recorded})"
        )))
    };

    if front.language != manifest.language {
        return mismatch("language", &front.language, &manifest.language);
    }
    if front.entry != manifest.entry {
        return mismatch("entry", &front.entry, &manifest.entry);
    }
    if front.template_version != manifest.template_version {
        return mismatch(
            "template_version",
            &front.template_version,
            &manifest.template_version,
        );
    }
    if front.network != manifest.allow.network {
        return mismatch(
            "network",
            &front.network.to_string(),
            &manifest.allow.network.to_string(),
        );
    }
    if front.deps != manifest.deps {
        return Err(IncantError::Template(format!(
            "front-matter deps {:?} do not match manifest deps {:?}",
            front.deps, manifest.deps
        )));
    }

    Ok(())
}

fn strip_comment(line: &str) -> Option<&str> {
    let trimmed = line.trim();
    trimmed
        .strip_prefix('#')
        .map(str::trim)
        .filter(|_| !trimmed.starts_with("#!"))
}
