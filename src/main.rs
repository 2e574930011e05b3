use clap::Parser;
use log::{error, info, warn};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use kili_export::io::{load_assets, load_project};
use kili_export::{export_to_file, Args};

fn main() -> ExitCode {
    // Initialize the logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let (project, ontology) = match load_project(&PathBuf::from(&args.project)) {
        Ok(loaded) => loaded,
        Err(e) => {
            error!("Failed to load project {}: {}", args.project, e);
            return ExitCode::FAILURE;
        }
    };
    let assets = match load_assets(&PathBuf::from(&args.assets)) {
        Ok(assets) => assets,
        Err(e) => {
            error!("Failed to load assets {}: {}", args.assets, e);
            return ExitCode::FAILURE;
        }
    };

    info!("Starting the export of {} assets...", assets.len());
    let options = args.to_export_options();
    let ontology = Arc::new(ontology);

    match export_to_file(&assets, &ontology, &project, &options, &PathBuf::from(&args.output)) {
        Ok(report) => {
            for failure in &report.failures {
                warn!("{}: {}", failure.external_id, failure.error);
            }
            report.summary.print_summary();
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("Export failed: {}", e);
            ExitCode::FAILURE
        }
    }
}
