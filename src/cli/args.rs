use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "aeroval-processor")]
#[command(about = "Colocate, resample and evaluate aerosol model output against observations")]
#[command(version)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    #[arg(short, long, global = true, help = "Enable verbose logging")]
    pub verbose: bool,

    #[arg(long, global = true, help = "Log file path")]
    pub log_file: Option<PathBuf>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run an evaluation over every configured combination
    Run {
        #[arg(short, long, help = "Evaluation configuration (TOML, YAML or JSON)")]
        config: PathBuf,

        #[arg(long, required = true, num_args = 1.., help = "Observation series CSV file(s)")]
        obs_data: Vec<PathBuf>,

        #[arg(long, required = true, num_args = 1.., help = "Model series CSV file(s)")]
        model_data: Vec<PathBuf>,

        #[arg(long, default_value_t = num_cpus::get())]
        max_workers: usize,

        #[arg(long, help = "Override coldata_basedir from the configuration")]
        coldata_dir: Option<PathBuf>,

        #[arg(long, help = "Override json_basedir from the configuration")]
        json_dir: Option<PathBuf>,

        #[arg(long, default_value = "false", help = "Hide the progress bar")]
        quiet: bool,
    },

    /// Load and validate a configuration without running it
    CheckConfig {
        #[arg(short, long)]
        config: PathBuf,
    },
}
