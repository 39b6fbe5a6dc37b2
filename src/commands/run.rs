/// `incant run` command implementation
///
/// Resolves the prompt to a cached script (generating on a miss), executes it
/// in the sandbox, and prints the structured result as JSON on stdout. Status
/// lines go to stderr so stdout stays machine-readable.
use std::fs;
use std::time::Duration;

use anyhow::{Context, Result};
use serde_json::Value;

use super::build_client;
use crate::cli::RunArgs;
use crate::client::RunOptions;
use crate::sandbox::ResultStatus;

pub async fn run(args: &RunArgs) -> Result<()> {
    let client = build_client(&args.common)?;
    let context = parse_context(&args.context)?;

    let opts = RunOptions {
        language: args.language.clone(),
        refresh: args.refresh,
        select: args.select.clone(),
        check_only: args.check,
        timeout: args.timeout.map(Duration::from_secs),
    };

    let outcome = client.run(&args.prompt, &context, &opts).await?;

    eprintln!(
        "[incant] {} {} ({})",
        outcome.fingerprint,
        match outcome.result.status {
            ResultStatus::Ok => "ok",
            ResultStatus::Error => "error",
        },
        if outcome.cache_hit {
            "cache hit"
        } else {
            "generated"
        }
    );

    println!("{}", serde_json::to_string_pretty(&outcome.result)?);

    if outcome.result.status == ResultStatus::Error {
        std::process::exit(1);
    }
    Ok(())
}

/// Parse the `--context` argument: inline JSON, or `@path` to a file.
fn parse_context(raw: &str) -> Result<Value> {
    let text = if let Some(path) = raw.strip_prefix('@') {
        fs::read_to_string(path).with_context(|| format!("Failed to read context file: {path}"))?
    } else {
        raw.to_string()
    };
    serde_json::from_str(&text).context("Context is not valid JSON")
}
