/// `incant show` command implementation
use anyhow::Result;

use super::build_client;
use crate::cli::ShowArgs;
use crate::fingerprint::Fingerprint;

pub fn run(args: &ShowArgs) -> Result<()> {
    let client = build_client(&args.common)?;
    let fp: Fingerprint = args.fingerprint.parse()?;

    let Some(entry) = client.get_entry(&fp)? else {
        anyhow::bail!("No cache entry for fingerprint {fp}");
    };

    if args.script {
        print!("{}", entry.script);
    } else {
        println!("{}", serde_json::to_string_pretty(&entry.manifest)?);
    }
    Ok(())
}
