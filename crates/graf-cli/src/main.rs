use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use graf_core::GrafConfig;
use graf_fetch::{
    check_all_sources, registry_from_catalog_csv, render_status_table, FetchOptions,
    FetchPipeline, FetchRunSummary, SourceRegistry,
};
use graf_mapping::MapperPipeline;
use graf_storage::{LlmClient, RawDataStore};

#[derive(Debug, Parser)]
#[command(name = "graf")]
#[command(about = "Grant registry acquisition framework")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Download every configured source that has gone stale.
    Fetch {
        /// Refetch even when a recent download exists.
        #[arg(long)]
        force: bool,
        /// Maximum age in days before a download counts as stale.
        #[arg(long, default_value_t = 7)]
        max_age: i64,
        /// Source ids to fetch (default: all).
        #[arg(long, num_args = 1..)]
        sources: Vec<String>,
        /// Build a sources.yaml from a catalog CSV instead of fetching.
        #[arg(long, value_name = "CSV_FILE")]
        init_from_csv: Option<PathBuf>,
        /// Where to write the generated registry (default: stdout).
        #[arg(long, requires = "init_from_csv")]
        out: Option<PathBuf>,
    },
    /// Map source columns onto the grant ontology.
    Map {
        /// Source id to map.
        #[arg(long, conflicts_with = "all")]
        source: Option<String>,
        /// Map every downloaded source.
        #[arg(long)]
        all: bool,
        /// Remap even when a cached mapping exists.
        #[arg(long)]
        force: bool,
    },
    /// Report per-source download status.
    Status {
        /// Emit JSON instead of a table.
        #[arg(long)]
        json: bool,
        /// Source ids to check (default: all).
        #[arg(long, num_args = 1..)]
        sources: Vec<String>,
    },
    /// Serve the read-only JSON API.
    Serve,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();
    let cli = Cli::parse();
    let config = GrafConfig::from_env();

    match cli.command {
        Commands::Fetch {
            force,
            max_age,
            sources,
            init_from_csv,
            out,
        } => {
            if let Some(catalog) = init_from_csv {
                return init_registry_from_catalog(&catalog, out.as_deref());
            }
            let registry = SourceRegistry::load(&config.sources_file)?;
            let raw_dir = config.raw_data_dir.clone();
            let pipeline = FetchPipeline::new(config, registry)?;
            let options = FetchOptions {
                force,
                max_age_days: max_age,
                sources: if sources.is_empty() { None } else { Some(sources) },
            };
            let summary = pipeline.run(&options).await?;
            print_fetch_summary(&summary, &raw_dir);
        }
        Commands::Map { source, all, force } => {
            if source.is_none() && !all {
                bail!("either --source or --all must be provided");
            }
            let model = LlmClient::from_env()?;
            let mapper = MapperPipeline::new(&config, Box::new(model));
            if all {
                let results = mapper.map_all(force).await;
                print_mapping_summary(&results, mapper.mappings_dir());
            } else if let Some(source) = source {
                if mapper.map_source(&source, force).await {
                    println!("Successfully mapped columns for {source}");
                } else {
                    println!("Failed to map columns for {source}");
                }
                println!("\nMappings stored in: {}", mapper.mappings_dir().display());
            }
        }
        Commands::Status { json, sources } => {
            let registry = SourceRegistry::load(&config.sources_file)?;
            let store = RawDataStore::new(&config.raw_data_dir);
            let filter = if sources.is_empty() { None } else { Some(sources) };
            let statuses =
                check_all_sources(&store, &registry, filter.as_deref(), chrono::Utc::now());
            if json {
                println!("{}", serde_json::to_string_pretty(&statuses)?);
            } else {
                println!("\n=== Grant Data Source Status ===\n");
                print!("{}", render_status_table(&statuses));
            }
        }
        Commands::Serve => {
            graf_web::serve_from_env().await?;
        }
    }

    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().compact())
        .init();
}

fn init_registry_from_catalog(catalog: &Path, out: Option<&Path>) -> Result<()> {
    let registry = registry_from_catalog_csv(catalog)?;
    let yaml = registry.to_yaml()?;
    match out {
        Some(path) => {
            std::fs::write(path, &yaml)?;
            println!(
                "Wrote {} sources to {}",
                registry.sources.len(),
                path.display()
            );
        }
        None => print!("{yaml}"),
    }
    Ok(())
}

fn print_fetch_summary(summary: &FetchRunSummary, raw_dir: &Path) {
    let total = summary.total();
    println!("\n===== FETCH SUMMARY =====");
    println!(
        "Successfully fetched: {}/{} sources",
        summary.successful.len(),
        total
    );
    println!(
        "Skipped (already downloaded): {}/{} sources",
        summary.skipped.len(),
        total
    );
    println!("Failed: {}/{} sources", summary.failed.len(), total);
    if !summary.successful.is_empty() {
        println!("\nSuccessful sources:");
        for source in &summary.successful {
            println!("  ✅ {source}");
        }
    }
    if !summary.skipped.is_empty() {
        println!("\nSkipped sources (already downloaded):");
        for source in &summary.skipped {
            println!("  ⏭️ {source}");
        }
    }
    if !summary.failed.is_empty() {
        println!("\nFailed sources:");
        for source in &summary.failed {
            println!("  ❌ {source}");
        }
    }
    println!("\nRaw data stored in: {}", raw_dir.display());
}

fn print_mapping_summary(results: &BTreeMap<String, bool>, mappings_dir: &Path) {
    let successful: Vec<&str> = results
        .iter()
        .filter(|(_, ok)| **ok)
        .map(|(s, _)| s.as_str())
        .collect();
    let failed: Vec<&str> = results
        .iter()
        .filter(|(_, ok)| !**ok)
        .map(|(s, _)| s.as_str())
        .collect();
    println!("\n===== MAPPING SUMMARY =====");
    println!(
        "Successfully mapped: {}/{} sources",
        successful.len(),
        results.len()
    );
    println!("Failed: {}/{} sources", failed.len(), results.len());
    if !successful.is_empty() {
        println!("\nSuccessful sources:");
        for source in successful {
            println!("  ✅ {source}");
        }
    }
    if !failed.is_empty() {
        println!("\nFailed sources:");
        for source in failed {
            println!("  ❌ {source}");
        }
    }
    println!("\nMappings stored in: {}", mappings_dir.display());
}
