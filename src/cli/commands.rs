use tracing::info;

use crate::cli::args::{Cli, Commands};
use crate::config::{EvalConfig, RunContext};
use crate::error::Result;
use crate::processors::{CombinationStatus, EvaluationProcessor};
use crate::readers::ConcurrentReader;
use crate::utils::progress::ProgressReporter;

pub async fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Commands::Run {
            config,
            obs_data,
            model_data,
            max_workers,
            coldata_dir,
            json_dir,
            quiet,
        } => {
            println!("Loading configuration: {}", config.display());
            let mut eval_config = EvalConfig::from_file(&config)?;
            if let Some(dir) = coldata_dir {
                eval_config.coldata_basedir = dir;
            }
            if let Some(dir) = json_dir {
                eval_config.json_basedir = dir;
            }
            let context = RunContext::from_config(eval_config)?;

            println!(
                "Reading {} observation and {} model file(s) with {} workers...",
                obs_data.len(),
                model_data.len(),
                max_workers
            );
            let reader = ConcurrentReader::new(max_workers);
            let catalog = reader.read_inputs(&obs_data, &model_data).await?;

            let processor = EvaluationProcessor::new(&context, &catalog).with_max_workers(max_workers);
            let total = processor.combinations().len();
            let progress = ProgressReporter::new(total as u64, "Evaluating...", quiet);
            let manifest = processor.run(Some(&progress))?;

            println!("\nRun summary:");
            println!("  Succeeded:         {}", manifest.count(CombinationStatus::Success));
            println!("  Insufficient data: {}", manifest.count(CombinationStatus::InsufficientData));
            println!("  Failed:            {}", manifest.count(CombinationStatus::Error));
            println!("  Skipped:           {}", manifest.count(CombinationStatus::Skipped));
            for outcome in manifest
                .outcomes
                .iter()
                .filter(|o| o.status == CombinationStatus::Error)
            {
                println!(
                    "  ✗ {}: {}",
                    outcome.key,
                    outcome.message.as_deref().unwrap_or("unknown error")
                );
            }
            println!(
                "Results written to {}",
                processor.writer().basedir().display()
            );

            manifest.into_result()?;
        }

        Commands::CheckConfig { config } => {
            println!("Checking configuration: {}", config.display());
            let eval_config = EvalConfig::from_file(&config)?;
            let context = RunContext::from_config(eval_config)?;

            let combinations: usize = context
                .obs
                .values()
                .map(|obs| context.models_for(obs).len() * obs.entry.obs_vars.len() * context.periods.len())
                .sum();
            info!(combinations, "configuration valid");

            println!("✅ Configuration is valid");
            println!("  Observation networks: {}", context.obs.len());
            println!("  Models:               {}", context.models.len());
            println!("  Periods:              {}", context.periods.len());
            println!("  Combinations:         {}", combinations);
            println!("  Region filter:        {}", context.filter.name);
        }
    }

    Ok(())
}
