use rayon::prelude::*;
use std::path::{Path, PathBuf};
use tokio::task::JoinHandle;
use tracing::info;

use crate::error::{ProcessingError, Result};
use crate::readers::csv_reader::SeriesCsvReader;
use crate::readers::provider::{InMemoryCatalog, SourceKind};

/// Loads observation and model input files concurrently into one catalog.
pub struct ConcurrentReader {
    max_workers: usize,
}

impl ConcurrentReader {
    pub fn new(max_workers: usize) -> Self {
        Self {
            max_workers: max_workers.max(1),
        }
    }

    /// Read both sides at once: each side runs on a blocking task and its
    /// files are parsed in parallel.
    pub async fn read_inputs(&self, obs_paths: &[PathBuf], model_paths: &[PathBuf]) -> Result<InMemoryCatalog> {
        let obs = obs_paths.to_vec();
        let models = model_paths.to_vec();
        let workers = self.max_workers;

        let obs_handle: JoinHandle<Result<InMemoryCatalog>> = tokio::task::spawn_blocking(move || {
            Self::read_files(&obs, SourceKind::Observation, workers)
        });
        let model_handle: JoinHandle<Result<InMemoryCatalog>> =
            tokio::task::spawn_blocking(move || Self::read_files(&models, SourceKind::Model, workers));

        let (obs_catalog, model_catalog) = tokio::try_join!(obs_handle, model_handle)?;
        let mut catalog = obs_catalog?;
        catalog.extend(model_catalog?);

        info!(
            obs_files = obs_paths.len(),
            model_files = model_paths.len(),
            series = catalog.len(),
            "inputs loaded"
        );
        Ok(catalog)
    }

    /// Read a set of files of one kind in parallel.
    pub fn read_files(paths: &[PathBuf], kind: SourceKind, max_workers: usize) -> Result<InMemoryCatalog> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(max_workers)
            .build()
            .map_err(|e| ProcessingError::Config(e.to_string()))?;

        let catalogs: Vec<InMemoryCatalog> = pool.install(|| {
            paths
                .par_iter()
                .map(|path| Self::read_one(path, kind))
                .collect::<Result<Vec<_>>>()
        })?;

        let mut merged = InMemoryCatalog::new();
        for catalog in catalogs {
            merged.extend(catalog);
        }
        Ok(merged)
    }

    fn read_one(path: &Path, kind: SourceKind) -> Result<InMemoryCatalog> {
        SeriesCsvReader::new().read_file(path, kind)
    }
}

impl Default for ConcurrentReader {
    fn default() -> Self {
        Self::new(num_cpus::get())
    }
}
