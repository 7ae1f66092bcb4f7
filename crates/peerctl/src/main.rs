//! peerctl - operator CLI for Peer Compute.
//!
//! Exit codes: 0 success, 1 user error (bad flags, missing trust),
//! 2 transport error (cannot reach the peer), 3 remote-reported error.

mod context;
mod deploy;
mod init;
mod logs;
mod parse;
mod peers;
mod status;
mod stop;

use clap::Command;

use context::Context;

/// CLI failure, classified for the exit-code contract.
#[derive(Debug)]
pub enum CliError {
    /// Bad flags, missing trust, local misconfiguration (exit 1)
    User(String),
    /// Could not reach or talk to the peer (exit 2)
    Transport(String),
    /// The peer answered with a typed error (exit 3)
    Remote(String),
}

impl std::fmt::Display for CliError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CliError::User(msg) | CliError::Transport(msg) | CliError::Remote(msg) => {
                f.write_str(msg)
            }
        }
    }
}

impl CliError {
    fn exit_code(&self) -> i32 {
        match self {
            CliError::User(_) => 1,
            CliError::Transport(_) => 2,
            CliError::Remote(_) => 3,
        }
    }
}

fn cli() -> Command {
    Command::new("peerctl")
        .about("deploy containers to trusted peers")
        .version(env!("CARGO_PKG_VERSION"))
        .subcommand_required(true)
        .arg_required_else_help(true)
        .subcommand(init::args())
        .subcommand(peers::args())
        .subcommand(deploy::args())
        .subcommand(logs::args())
        .subcommand(stop::args())
        .subcommand(status::args())
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let matches = cli().get_matches();
    let context = Context::new();

    let result = match matches.subcommand() {
        Some(("init", submatches)) => init::handlers(submatches, &context),
        Some(("peers", submatches)) => peers::handlers(submatches, &context),
        Some(("deploy", submatches)) => deploy::handlers(submatches, &context).await,
        Some(("logs", submatches)) => logs::handlers(submatches, &context).await,
        Some(("stop", submatches)) => stop::handlers(submatches, &context).await,
        Some(("status", submatches)) => status::handlers(submatches, &context).await,
        _ => unreachable!(),
    };

    if let Err(error) = result {
        eprintln!("error: {error}");
        std::process::exit(error.exit_code());
    }
}
