extern crate civr as lib;

use anyhow::{Context, Error};
use structopt::StructOpt;
use tracing_subscriber::filter::LevelFilter;

use lib::cli::{resolve, serve};

#[derive(StructOpt)]
enum Command {
    /// Resolves a lockfile (or `crate@version`) against the historical
    /// registry index.
    #[structopt(name = "resolve")]
    Resolve(resolve::Args),
    /// Serves the `/resolve` HTTP endpoint.
    #[structopt(name = "serve")]
    Serve(serve::Args),
}

fn parse_level(s: &str) -> Result<LevelFilter, Error> {
    s.parse::<LevelFilter>()
        .map_err(|_| anyhow::anyhow!("failed to parse level '{}'", s))
}

#[derive(StructOpt)]
struct Opts {
    #[structopt(
        short = "L",
        long = "log-level",
        default_value = "info",
        parse(try_from_str = parse_level),
        long_help = "The log level for messages, only log messages at or above the level will be emitted.

Possible values:
* off
* error
* warn
* info (default)
* debug
* trace"
    )]
    log_level: LevelFilter,
    /// Output log messages as json
    #[structopt(long)]
    json: bool,
    #[structopt(subcommand)]
    cmd: Command,
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    let args = Opts::from_args();

    let mut env_filter = tracing_subscriber::EnvFilter::from_default_env();
    env_filter = env_filter.add_directive(args.log_level.into());
    let subscriber = tracing_subscriber::FmtSubscriber::builder().with_env_filter(env_filter);

    if args.json {
        tracing::subscriber::set_global_default(subscriber.json().finish())
            .context("failed to set default subscriber")?;
    } else {
        tracing::subscriber::set_global_default(subscriber.finish())
            .context("failed to set default subscriber")?;
    }

    match args.cmd {
        Command::Resolve(resolve_args) => resolve::run(resolve_args).await,
        Command::Serve(serve_args) => serve::run(serve_args).await,
    }
}
