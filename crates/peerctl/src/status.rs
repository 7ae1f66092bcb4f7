//! `peerctl status` - query deployments on a peer.

use clap::{Arg, ArgAction, ArgMatches, Command};

use crate::context::{map_p2p_error, Context};
use crate::CliError;

pub fn args() -> Command {
    Command::new("status")
        .about("show deployment status")
        .arg(
            Arg::new("DEPLOYMENT_ID")
                .help("deployment to query; all deployments when omitted")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("peer")
                .long("peer")
                .required(true)
                .help("peer id or name to query")
                .action(ArgAction::Set),
        )
}

pub async fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let deployment_id = matches.get_one::<String>("DEPLOYMENT_ID").cloned();

    let (client, trust, _identity) = context.client()?;
    let peer = Context::resolve_peer(&trust, matches.get_one::<String>("peer").expect("required"))?;

    let response = client
        .status(&peer.id, deployment_id)
        .await
        .map_err(map_p2p_error)?;

    if let Some(error) = response.error {
        return Err(CliError::Remote(format!(
            "{}: {}",
            error.kind, error.message
        )));
    }

    if response.deployments.is_empty() {
        println!("No active deployments");
        return Ok(());
    }
    if let Some(usage) = &response.resource_usage {
        println!(
            "usage: cpu={:.2}% mem={}/{} bytes",
            usage.cpu_percent, usage.memory_bytes, usage.memory_limit
        );
    }
    for deployment in response.deployments {
        let url = deployment.exposed_url.as_deref().unwrap_or("-");
        println!(
            "{}  {}  {}  cpu={}m mem={}  url={}",
            deployment.id,
            deployment.status,
            deployment.image,
            deployment.cpu_limit,
            deployment.memory_limit,
            url
        );
    }
    Ok(())
}
