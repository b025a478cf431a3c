use chrono::NaiveDate;
use clap::{Args, Parser};
use requestor::registry::HandleRegistry;
use requestor::{CreateParams, DateRange, HandleKind, VerifyOutcome, run_batch};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

mod config;
mod telemetry;

use config::Config;

#[derive(Parser)]
#[command(name = "pipeline", about = "App Store Connect analytics report requests")]
enum CliCommand {
    /// Resolve a report request handle for every entity.
    Run(RunArgs),
    /// Print every registry record of a kind.
    ListRegistry(RegistryArgs),
    /// Check every registry record of a kind against the remote API.
    VerifyRegistry(RegistryArgs),
}

#[derive(Args)]
struct RunArgs {
    #[arg(long)]
    config: PathBuf,
    /// Defaults to the entities listed in the config file.
    #[arg(long = "entity")]
    entities: Vec<String>,
    #[arg(long, default_value = "recurring")]
    kind: HandleKind,
    #[arg(long, requires = "end")]
    start: Option<NaiveDate>,
    #[arg(long, requires = "start")]
    end: Option<NaiveDate>,
}

#[derive(Args)]
struct RegistryArgs {
    #[arg(long)]
    config: PathBuf,
    #[arg(long, default_value = "recurring")]
    kind: HandleKind,
}

impl CliCommand {
    fn config_path(&self) -> &Path {
        match self {
            CliCommand::Run(args) => &args.config,
            CliCommand::ListRegistry(args) | CliCommand::VerifyRegistry(args) => &args.config,
        }
    }
}

fn main() -> ExitCode {
    let cli = CliCommand::parse();

    let config = match Config::from_file(cli.config_path()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("{}: {e}", cli.config_path().display());
            return ExitCode::FAILURE;
        }
    };

    let _telemetry = match telemetry::init(config.logging.as_ref(), config.metrics.as_ref()) {
        Ok(telemetry) => telemetry,
        Err(e) => {
            eprintln!("could not initialize telemetry: {e}");
            return ExitCode::FAILURE;
        }
    };

    let rt = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(rt) => rt,
        Err(e) => {
            tracing::error!(error = %e, "Could not start the runtime");
            return ExitCode::FAILURE;
        }
    };

    let result = rt.block_on(async {
        match &cli {
            CliCommand::Run(args) => run(args, &config).await,
            CliCommand::ListRegistry(args) => list_registry(args, &config).await,
            CliCommand::VerifyRegistry(args) => verify_registry(args, &config).await,
        }
    });

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "Startup failed");
            ExitCode::FAILURE
        }
    }
}

#[derive(thiserror::Error, Debug)]
enum StartupError {
    #[error("no entities given and none configured")]
    NoEntities,
    #[error("could not set up the API client: {0}")]
    Api(#[from] requestor::remote::ApiError),
    #[error("could not read the registry: {0}")]
    Registry(#[from] requestor::registry::RegistryError),
}

async fn run(args: &RunArgs, config: &Config) -> Result<(), StartupError> {
    let entities = if args.entities.is_empty() {
        &config.entities
    } else {
        &args.entities
    };
    if entities.is_empty() {
        return Err(StartupError::NoEntities);
    }

    let params = match (args.start, args.end) {
        (Some(start), Some(end)) => CreateParams::with_range(DateRange::new(start, end)),
        _ => CreateParams::default(),
    };

    let lifecycle = requestor::build(&config.requestor)?;
    tracing::info!(entities = entities.len(), kind = %args.kind, "Starting run");

    // Per-entity failures are part of the report, not of the exit status.
    let report = run_batch(&lifecycle, entities, args.kind, &params).await;
    print!("{report}");
    Ok(())
}

async fn list_registry(args: &RegistryArgs, config: &Config) -> Result<(), StartupError> {
    let store = requestor::store::from_config(&config.requestor.registry.store);
    let records = HandleRegistry::new(store).list(args.kind).await?;

    for record in &records {
        println!(
            "{}\t{}\tcreated {}\tverified {}{}",
            record.entity_id,
            record.handle_id,
            record.created_at.to_rfc3339(),
            record.last_verified_at.to_rfc3339(),
            record
                .range
                .as_deref()
                .map(|r| format!("\trange {r}"))
                .unwrap_or_default()
        );
    }
    println!("{} {} records", records.len(), args.kind);
    Ok(())
}

async fn verify_registry(args: &RegistryArgs, config: &Config) -> Result<(), StartupError> {
    let lifecycle = requestor::build(&config.requestor)?;
    let records = lifecycle.registry().list(args.kind).await?;

    let mut totals: BTreeMap<&'static str, usize> = BTreeMap::new();
    for record in &records {
        let outcome = lifecycle.verify(&record.handle_id).await;
        match &outcome {
            VerifyOutcome::Error(reason) => {
                println!("{}\t{}\terror: {reason}", record.entity_id, record.handle_id)
            }
            other => println!("{}\t{}\t{}", record.entity_id, record.handle_id, other.as_str()),
        }
        *totals.entry(outcome.as_str()).or_default() += 1;
    }

    println!("verified {} {} records", records.len(), args.kind);
    for (outcome, count) in totals {
        println!("  {outcome}: {count}");
    }
    Ok(())
}
