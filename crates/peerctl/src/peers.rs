//! `peerctl peers` - manage the trust list.

use clap::{arg, Arg, ArgAction, ArgMatches, Command};

use crate::context::{parse_peer_id, Context};
use crate::CliError;

pub fn args() -> Command {
    Command::new("peers")
        .about("manage trusted peers")
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(
            Command::new("add")
                .about("add a trusted peer")
                .arg(arg!(<PEER_ID> "peer id to trust"))
                .arg(
                    Arg::new("name")
                        .long("name")
                        .help("display name for the peer")
                        .action(ArgAction::Set),
                )
                .arg(
                    Arg::new("addr")
                        .long("addr")
                        .help("known address (host:port), repeatable")
                        .action(ArgAction::Append),
                ),
        )
        .subcommand(
            Command::new("remove")
                .about("remove a trusted peer")
                .arg(arg!(<PEER_ID> "peer id to remove")),
        )
        .subcommand(Command::new("list").about("list trusted peers"))
}

pub fn handlers(matches: &ArgMatches, context: &Context) -> Result<(), CliError> {
    let trust = context.open_trust()?;

    match matches.subcommand() {
        Some(("add", submatches)) => {
            let id = parse_peer_id(
                submatches
                    .get_one::<String>("PEER_ID")
                    .expect("PEER_ID is required"),
            )?;
            let name = submatches.get_one::<String>("name").cloned();
            let addresses: Vec<String> = submatches
                .get_many::<String>("addr")
                .map(|values| values.cloned().collect())
                .unwrap_or_default();

            trust
                .add(id.clone(), name, addresses)
                .map_err(|e| CliError::User(format!("cannot update trust list: {e}")))?;
            println!("Added {id} to the trust list");
            println!("Trust is mutual: the peer must also add your id.");
            Ok(())
        }
        Some(("remove", submatches)) => {
            let id = parse_peer_id(
                submatches
                    .get_one::<String>("PEER_ID")
                    .expect("PEER_ID is required"),
            )?;
            trust
                .remove(&id)
                .map_err(|e| CliError::User(e.to_string()))?;
            println!("Removed {id} from the trust list");
            Ok(())
        }
        Some(("list", _)) => {
            let peers = trust.list();
            if peers.is_empty() {
                println!("No trusted peers. Add one with `peerctl peers add <peer-id>`.");
                return Ok(());
            }
            for peer in peers {
                let name = peer.name.as_deref().unwrap_or("-");
                let addresses = if peer.addresses.is_empty() {
                    "-".to_string()
                } else {
                    peer.addresses.join(", ")
                };
                println!(
                    "{}  name={}  added={}  addrs={}",
                    peer.id,
                    name,
                    peer.added_at.format("%Y-%m-%d"),
                    addresses
                );
            }
            Ok(())
        }
        _ => unreachable!(),
    }
}
