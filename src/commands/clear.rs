/// `incant clear` command implementation
use std::io::{self, Write};

use anyhow::Result;

use super::build_client;
use crate::cli::ClearArgs;

pub fn run(args: &ClearArgs) -> Result<()> {
    let client = build_client(&args.common)?;

    if !args.force {
        let count = client.list_entries()?.len();
        print!("Remove {count} cached entries (including archives)? [y/N] ");
        io::stdout().flush()?;

        let mut answer = String::new();
        io::stdin().read_line(&mut answer)?;
        if !matches!(answer.trim(), "y" | "Y" | "yes") {
            println!("Aborted.");
            return Ok(());
        }
    }

    client.clear_store()?;
    println!("Store cleared.");
    Ok(())
}
