//! `peerctl stop` - stop a deployment on a peer.

use clap::{arg, Arg, ArgAction, ArgMatches, Command};

use peercompute_core::message::ErrorKind;

use crate::context::{map_p2p_error, Context};
use crate::CliError;

pub fn args() -> Command {
    Command::new("stop")
        .about("stop a deployment")
        .arg(arg!(<DEPLOYMENT_ID> "deployment to stop"))
        .arg(
            Arg::new("peer")
                .long("peer")
                .required(true)
                .help("peer id or name hosting the deployment")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("force")
                .long("force")
                .help("succeed even if the deployment is already gone")
                .action(ArgAction::SetTrue),
        )
}

pub async fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let deployment_id = matches
        .get_one::<String>("DEPLOYMENT_ID")
        .expect("DEPLOYMENT_ID is required")
        .clone();
    let force = matches.get_flag("force");

    let (client, trust, _identity) = context.client()?;
    let peer = Context::resolve_peer(&trust, matches.get_one::<String>("peer").expect("required"))?;

    let response = client
        .stop(&peer.id, deployment_id.clone())
        .await
        .map_err(map_p2p_error)?;

    if let Some(error) = response.error {
        if force && error.kind == ErrorKind::NotFound {
            println!("Deployment {deployment_id} already gone");
            return Ok(());
        }
        return Err(CliError::Remote(format!(
            "{}: {}",
            error.kind, error.message
        )));
    }

    println!("Stopped {deployment_id}");
    Ok(())
}
