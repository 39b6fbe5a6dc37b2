/// `incant invalidate` command implementation
///
/// Applies an external signal to a cached entry and reports the decision.
use anyhow::Result;

use super::build_client;
use crate::cli::{InvalidateArgs, SignalCommand};
use crate::fingerprint::Fingerprint;
use crate::invalidate::{Decision, Signal};

pub fn run(args: &InvalidateArgs) -> Result<()> {
    let fp: Fingerprint = args.fingerprint.parse()?;

    let (signal, common) = match &args.signal {
        SignalCommand::DependencyDrift {
            dependency,
            resolved,
            vulnerable,
            common,
        } => (
            Signal::DependencyDrift {
                dependency: dependency.clone(),
                resolved: resolved.clone(),
                vulnerable: *vulnerable,
            },
            common,
        ),
        SignalCommand::Advisory { subject, common } => (
            Signal::Advisory {
                subject: subject.clone(),
            },
            common,
        ),
        SignalCommand::ExecutionFailure { fixable, common } => (
            Signal::ExecutionFailure { fixable: *fixable },
            common,
        ),
    };

    let client = build_client(common)?;
    let decision = client.apply_signal(&fp, &signal)?;

    match decision {
        Decision::Keep => println!("{fp}: entry kept"),
        Decision::RegenerateSameFingerprint => {
            println!("{fp}: entry archived, will regenerate on next run")
        }
        Decision::RegenerateNewFingerprint => {
            println!("{fp}: entry retained, new requests resolve to a new fingerprint")
        }
    }
    Ok(())
}
