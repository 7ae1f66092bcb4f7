//! `peerctl logs` - stream container logs from a peer.

use std::io::Write;

use clap::{arg, Arg, ArgAction, ArgMatches, Command};

use peercompute_core::message::{LogEntry, MessageType};

use crate::context::{map_p2p_error, Context};
use crate::CliError;

pub fn args() -> Command {
    Command::new("logs")
        .about("stream logs from a deployment")
        .arg(arg!(<DEPLOYMENT_ID> "deployment to read logs from"))
        .arg(
            Arg::new("peer")
                .long("peer")
                .required(true)
                .help("peer id or name hosting the deployment")
                .action(ArgAction::Set),
        )
        .arg(
            Arg::new("follow")
                .long("follow")
                .short('f')
                .help("keep streaming new log output")
                .action(ArgAction::SetTrue),
        )
        .arg(
            Arg::new("tail")
                .long("tail")
                .help("only show the last N lines")
                .value_parser(clap::value_parser!(usize))
                .action(ArgAction::Set),
        )
}

pub async fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let deployment_id = matches
        .get_one::<String>("DEPLOYMENT_ID")
        .expect("DEPLOYMENT_ID is required")
        .clone();
    let follow = matches.get_flag("follow");
    let tail = matches.get_one::<usize>("tail").copied();

    let (client, trust, _identity) = context.client()?;
    let peer = Context::resolve_peer(&trust, matches.get_one::<String>("peer").expect("required"))?;

    let mut stream = client
        .logs(&peer.id, deployment_id, follow, tail)
        .await
        .map_err(map_p2p_error)?;

    let stdout = std::io::stdout();
    loop {
        let frame = match stream.try_recv_frame().await {
            Ok(Some(frame)) => frame,
            Ok(None) => break,
            Err(e) => return Err(CliError::Transport(e.to_string())),
        };
        if frame.tag != MessageType::LogEntry {
            continue;
        }
        let entry: LogEntry = frame
            .decode()
            .map_err(|e| CliError::Transport(e.to_string()))?;
        let mut out = stdout.lock();
        out.write_all(&entry.data)
            .and_then(|_| out.flush())
            .map_err(|e| CliError::User(e.to_string()))?;
    }
    Ok(())
}
