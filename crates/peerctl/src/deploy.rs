//! `peerctl deploy` - deploy a container to a trusted peer.

use clap::{arg, Arg, ArgAction, ArgMatches, Command};
use uuid::Uuid;

use peercompute_core::message::DeployRequest;

use crate::context::{map_p2p_error, Context};
use crate::parse::{parse_cpu, parse_duration, parse_env, parse_memory};
use crate::CliError;

pub fn args() -> Command {
    Command::new("deploy")
        .about("deploy a container to a peer")
        .arg(arg!(<IMAGE> "container image, e.g. nginx:alpine"))
        .arg(
            Arg::new("peer")
                .long("peer")
                .required(true)
                .help("target peer id or name")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("cpu")
                .long("cpu")
                .default_value("0.5")
                .help("cpu cores, e.g. 0.5")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("memory")
                .long("memory")
                .default_value("256M")
                .help("memory limit, e.g. 256M or 1G")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("expose")
                .long("expose")
                .help("container port to expose publicly")
                .value_parser(clap::value_parser!(u16))
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("env")
                .long("env")
                .help("environment variable KEY=VALUE, repeatable")
                .action(ArgAction::Append),
        )
        .arg(
            Arg::new("timeout")
                .long("timeout")
                .default_value("5m")
                .help("overall deadline, e.g. 30s or 5m")
                .action(ArgAction::Set),
        )
}

pub async fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let image = matches
        .get_one::<String>("IMAGE")
        .expect("IMAGE is required")
        .clone();
    let cpu_millicores = parse_cpu(matches.get_one::<String>("cpu").expect("has default"))?;
    let memory_bytes = parse_memory(matches.get_one::<String>("memory").expect("has default"))?;
    let expose_port = matches.get_one::<u16>("expose").copied().unwrap_or(0);
    let environment = parse_env(
        &matches
            .get_many::<String>("env")
            .map(|values| values.cloned().collect::<Vec<_>>())
            .unwrap_or_default(),
    )?;
    let timeout = parse_duration(matches.get_one::<String>("timeout").expect("has default"))?;

    let (client, trust, identity) = context.client()?;
    let peer = Context::resolve_peer(&trust, matches.get_one::<String>("peer").expect("required"))?;

    let request = DeployRequest {
        request_id: Uuid::new_v4().to_string(),
        image: image.clone(),
        cpu_millicores,
        memory_bytes,
        expose_port,
        environment,
        requester_id: identity.peer_id().clone(),
        timestamp: 0,
        signature: Vec::new(),
    };

    println!("Deploying {image} to {}...", peer.id);
    let response = tokio::time::timeout(timeout, client.deploy(&peer.id, request))
        .await
        .map_err(|_| CliError::Transport("deploy timed out".to_string()))?
        .map_err(map_p2p_error)?;

    if let Some(error) = response.error {
        return Err(CliError::Remote(format!(
            "{}: {}",
            error.kind, error.message
        )));
    }

    println!(
        "Deployment: {}",
        response.deployment_id.as_deref().unwrap_or("-")
    );
    if let Some(container) = &response.container_id {
        println!("Container:  {container}");
    }
    if let Some(url) = &response.exposed_url {
        println!("Public URL: {url}");
    }
    Ok(())
}
