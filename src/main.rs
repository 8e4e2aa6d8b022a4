use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tracing::{error, info};

use catalog_concerns::config::DEFAULT_CONFIG_PATH;
use catalog_concerns::{logging, Pipeline, PipelineConfig};

#[derive(Parser, Debug)]
#[command(name = "catalog-concerns", version, about = "Catalog category and concern pipeline")]
struct Cli {
    /// Pipeline configuration file (YAML)
    #[arg(long, global = true, default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
#[command(rename_all = "kebab-case")]
enum Command {
    /// Build the canonical universe and product table from saved listing responses
    IngestProducts {
        #[arg(required = true)]
        payloads: Vec<PathBuf>,
    },
    /// Build category rows from saved category listing responses
    IngestCategories {
        #[arg(required = true)]
        payloads: Vec<PathBuf>,
    },
    /// Build the official concern map from scraped listing links (JSON or CSV)
    IngestOfficial { listing: PathBuf },
    /// Aggregate official concerns per canonical product
    Official,
    /// Predict concerns from OCR keywords
    Predict,
    /// Merge official and predicted concerns
    Final,
    /// Attach category aggregates to the product table
    Features,
    /// Check the latest snapshots and report row counts
    Validate,
    /// Run official, predict, final and features in order
    Run,
}

fn execute(pipeline: &Pipeline, command: Command) -> Result<()> {
    match command {
        Command::IngestProducts { payloads } => {
            let (universe, products) = pipeline.ingest_products(&payloads)?;
            info!(universe = %universe.display(), products = %products.display(), "saved");
        }
        Command::IngestCategories { payloads } => {
            let path = pipeline.ingest_categories(&payloads)?;
            info!(path = %path.display(), "saved");
        }
        Command::IngestOfficial { listing } => {
            let path = pipeline.ingest_official(&listing)?;
            info!(path = %path.display(), "saved");
        }
        Command::Official => {
            pipeline.derive_official()?;
        }
        Command::Predict => {
            pipeline.derive_predictions()?;
        }
        Command::Final => {
            pipeline.derive_final()?;
        }
        Command::Features => {
            pipeline.build_features()?;
        }
        Command::Validate => {
            let reports = pipeline.validate()?;
            let missing = reports.iter().filter(|r| r.path.is_none()).count();
            info!(tables = reports.len(), missing, "validation finished");
        }
        Command::Run => {
            let summary = pipeline.run_all()?;
            info!(final_concerns = %summary.final_concerns.display(), "run finished");
        }
    }
    Ok(())
}

fn main() -> Result<()> {
    logging::init();
    let cli = Cli::parse();

    let config = PipelineConfig::load(&cli.config)
        .with_context(|| format!("failed to load config {:?}", cli.config))?;
    let pipeline = Pipeline::new(config);

    if let Err(err) = execute(&pipeline, cli.command) {
        error!("{:#}", err);
        return Err(err);
    }
    Ok(())
}
