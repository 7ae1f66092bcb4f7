//! `peerctl init` - create the local identity.

use clap::{Arg, ArgAction, ArgMatches, Command};

use peercompute_core::Identity;

use crate::context::Context;
use crate::CliError;

pub fn args() -> Command {
    Command::new("init")
        .about("create a new identity")
        .arg(
            Arg::new("force")
                .long("force")
                .help("overwrite an existing identity")
                .action(ArgAction::SetTrue),
        )
}

pub fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let path = context.identity_path();
    if path.exists() && !matches.get_flag("force") {
        return Err(CliError::User(format!(
            "identity already exists at {}; use --force to replace it",
            path.display()
        )));
    }

    let identity = Identity::generate();
    identity
        .save(&path)
        .map_err(|e| CliError::User(format!("cannot write identity: {e}")))?;

    println!("Identity created: {}", identity.peer_id());
    println!("Key file: {}", path.display());
    println!("Share the peer id with operators who should trust this machine.");
    Ok(())
}
