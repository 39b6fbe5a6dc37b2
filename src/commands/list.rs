/// `incant list` command implementation
use anyhow::Result;

use super::build_client;
use crate::cli::ListArgs;

pub fn run(args: &ListArgs) -> Result<()> {
    let client = build_client(&args.common)?;
    let manifests = client.list_entries()?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&manifests)?);
        return Ok(());
    }

    if manifests.is_empty() {
        println!("No cached entries.");
        return Ok(());
    }

    for manifest in &manifests {
        if args.verbose {
            println!(
                "{}  {}  {}  deps={}  network={}  created {}",
                manifest.fingerprint,
                manifest.language,
                manifest.template_version,
                manifest.deps.len(),
                manifest.allow.network,
                manifest.created_at.format("%Y-%m-%d %H:%M:%S"),
            );
        } else {
            println!("{}  {}", manifest.fingerprint, manifest.language);
        }
    }
    println!();
    println!("{} entries", manifests.len());

    Ok(())
}
