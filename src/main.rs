mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use tracing::error;
use tracing_subscriber::EnvFilter;

use crate::cli::{Cli, Commands};
use crate::commands::Session;

fn main() {
    init_tracing();

    if let Err(err) = run() {
        error!(error = %err, "command failed");
        for cause in err.chain().skip(1) {
            error!(cause = %cause, "caused by");
        }
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    let session = Session::open(&cli.global)?;

    match cli.command {
        Commands::ImportProposal(args) => commands::import::run(&session, args),
        Commands::IngestKb(args) => commands::ingest_kb::run(&session, args),
        Commands::Sanitize(args) => commands::sanitize::run(&session, args),
        Commands::Enforce(args) => commands::enforce::run(&session, args),
        Commands::MapCitations(args) => commands::citations::run(&session, args),
        Commands::Coverage(args) => commands::citations::coverage(&session, args),
        Commands::VerifyClaims(args) => commands::verify::run(&session, args),
        Commands::Ambiguity(args) => commands::ambiguity::run(&session, args),
        Commands::ResolveAmbiguity(args) => commands::ambiguity::resolve(&session, args),
        Commands::Compliance(args) => commands::compliance::run(&session, args),
        Commands::ExportGate(args) => commands::export::run(&session, args),
        Commands::Attest(args) => commands::export::attest(&session, args),
        Commands::Status(args) => commands::status::run(&session, args),
    }
}

fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();
}
