use clap::Parser;
use std::process::exit;
use tracing_subscriber::EnvFilter;
use treesnap::commands::BuildCommand;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    if let Err(e) = BuildCommand::parse().exec() {
        eprintln!("error: {e:?}");
        exit(1);
    }
}
