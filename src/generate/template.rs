/// Built-in template generator
///
/// Offline stand-in for the remote generation backend: picks a script
/// template by keyword matching on the prompt and fills in the front-matter
/// and manifest. Used when no backend URL is configured, and by tests.
use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::Utc;
use tracing::debug;

use super::{Candidate, GenerationRequest, ScriptGenerator};
use crate::error::{IncantError, Result};
use crate::fingerprint;
use crate::store::{content_sha, Manifest, Permissions};

#[derive(Debug, Default)]
pub struct TemplateGenerator;

impl TemplateGenerator {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ScriptGenerator for TemplateGenerator {
    async fn generate(&self, request: &GenerationRequest) -> Result<Candidate> {
        let template = select_template(request)?;
        debug!(
            operation = "generate",
            template = template.name,
            language = %request.language,
            "selected built-in template"
        );
        build_candidate(request, template)
    }
}

struct Template {
    name: &'static str,
    entry: &'static str,
    deps: &'static [&'static str],
    network: bool,
    outputs: &'static [(&'static str, &'static str)],
    body: &'static str,
    summary: &'static str,
}

fn select_template(request: &GenerationRequest) -> Result<&'static Template> {
    match request.language.as_str() {
        "python" => {
            let prompt = request.prompt.to_lowercase();
            if ["video", "concat", "merge", "mp4"]
                .iter()
                .any(|kw| prompt.contains(kw))
            {
                Ok(&VIDEO_CONCAT)
            } else if ["item", "price", "api", "fetch"]
                .iter()
                .any(|kw| prompt.contains(kw))
            {
                Ok(&ITEM_FETCH)
            } else {
                Ok(&GENERIC_PYTHON)
            }
        }
        "bash" => Ok(&GENERIC_BASH),
        other => Err(IncantError::Validation(format!(
            "unsupported language: {other:?}"
        ))),
    }
}

fn build_candidate(request: &GenerationRequest, template: &Template) -> Result<Candidate> {
    let front_matter = format!(
        "# --- INCANT ---\n\
         # language: {language}\n\
         # entry: {entry}\n\
         # deps: {deps}\n\
         # network: {network}\n\
         # template_version: {version}\n\
         # --- /INCANT ---\n",
        language = request.language,
        entry = template.entry,
        deps = template.deps.join(", "),
        network = template.network,
        version = request.template_version,
    );
    let script = format!("{front_matter}\n{}", template.body);

    let requirements = if template.deps.is_empty() {
        String::new()
    } else {
        format!("{}\n", template.deps.join("\n"))
    };

    let sha = content_sha(&script, &requirements);
    let manifest = Manifest {
        fingerprint: fingerprint::fingerprint(
            &request.prompt,
            &request.context,
            &request.language,
            &request.template_version,
        )?,
        prompt_sha: fingerprint::prompt_sha(&request.prompt),
        context_sha: fingerprint::context_sha(&request.context)?,
        language: request.language.clone(),
        entry: template.entry.to_string(),
        runtime: runtime_for(&request.language),
        deps: template.deps.iter().map(|d| d.to_string()).collect(),
        allow: Permissions {
            network: template.network,
            fs: Vec::new(),
            exclusive: false,
        },
        template_version: request.template_version.clone(),
        created_at: Utc::now(),
        outputs: template
            .outputs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect(),
        aliases: BTreeMap::new(),
        content_sha: sha.clone(),
    };

    let readme = format!(
        "# {name}\n\n{summary}\n\nPrompt: {prompt}\n",
        name = template.name,
        summary = template.summary,
        prompt = request.prompt,
    );

    Ok(Candidate {
        manifest,
        script,
        requirements,
        readme,
        asserted_sha: sha,
    })
}

fn runtime_for(language: &str) -> BTreeMap<String, String> {
    match language {
        "python" => BTreeMap::from([("python".to_string(), "3.11".to_string())]),
        "bash" => BTreeMap::from([("bash".to_string(), "5".to_string())]),
        _ => BTreeMap::new(),
    }
}

static VIDEO_CONCAT: Template = Template {
    name: "video_concat",
    entry: "script.py",
    deps: &["moviepy==1.0.3"],
    network: false,
    outputs: &[("duration", "float"), ("clips", "int")],
    summary: "Concatenates the input video files into a single output file.",
    body: r#"import json
import sys

from moviepy.editor import VideoFileClip, concatenate_videoclips


def load_context(arg):
    if arg.startswith("@"):
        with open(arg[1:]) as handle:
            return json.load(handle)
    return json.loads(arg)


def main():
    context = load_context(sys.argv[1]) if len(sys.argv) > 1 else {}
    inputs = context.get("inputs", [])
    output = context.get("output", "output.mp4")
    try:
        clips = [VideoFileClip(path) for path in inputs]
        final = concatenate_videoclips(clips)
        final.write_videofile(output, logger=None)
        result = {
            "status": "ok",
            "artifacts": [output],
            "output": {"duration": final.duration, "clips": len(clips)},
            "raw": {"template": "video_concat"},
        }
    except Exception as exc:
        result = {
            "status": "error",
            "artifacts": [],
            "output": {"message": str(exc)},
            "raw": {"template": "video_concat"},
        }
    print(json.dumps(result))


if __name__ == "__main__":
    main()
"#,
};

static ITEM_FETCH: Template = Template {
    name: "item_fetch",
    entry: "script.py",
    deps: &["requests==2.31.0"],
    network: true,
    outputs: &[("title", "str"), ("price", "float")],
    summary: "Fetches item details from the marketplace API.",
    body: r#"import json
import sys

import requests


def load_context(arg):
    if arg.startswith("@"):
        with open(arg[1:]) as handle:
            return json.load(handle)
    return json.loads(arg)


def main():
    context = load_context(sys.argv[1]) if len(sys.argv) > 1 else {}
    item_id = context.get("item_id", "")
    try:
        response = requests.get(
            f"https://api.mercadolibre.com/items/{item_id}", timeout=30
        )
        response.raise_for_status()
        payload = response.json()
        result = {
            "status": "ok",
            "artifacts": [],
            "output": {
                "title": payload.get("title"),
                "price": payload.get("price"),
            },
            "raw": {"template": "item_fetch", "status_code": response.status_code},
        }
    except Exception as exc:
        result = {
            "status": "error",
            "artifacts": [],
            "output": {"message": str(exc)},
            "raw": {"template": "item_fetch"},
        }
    print(json.dumps(result))


if __name__ == "__main__":
    main()
"#,
};

static GENERIC_PYTHON: Template = Template {
    name: "generic",
    entry: "script.py",
    deps: &[],
    network: false,
    outputs: &[("echo", "object")],
    summary: "Echoes the request context back as the structured result.",
    body: r#"import json
import sys


def load_context(arg):
    if arg.startswith("@"):
        with open(arg[1:]) as handle:
            return json.load(handle)
    return json.loads(arg)


def main():
    context = load_context(sys.argv[1]) if len(sys.argv) > 1 else {}
    print(
        json.dumps(
            {
                "status": "ok",
                "artifacts": [],
                "output": {"echo": context},
                "raw": {"template": "generic"},
            }
        )
    )


if __name__ == "__main__":
    main()
"#,
};

static GENERIC_BASH: Template = Template {
    name: "generic",
    entry: "script.sh",
    deps: &[],
    network: false,
    outputs: &[("echo", "object")],
    summary: "Echoes the request context back as the structured result.",
    body: r#"context="${1:-null}"
if [ "${context#@}" != "$context" ]; then
    context="$(cat "${context#@}")"
fi

printf '{"status":"ok","artifacts":[],"output":{"echo":%s},"raw":{"template":"generic"}}\n' "$context"
"#,
};
