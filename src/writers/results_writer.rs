use serde::de::DeserializeOwned;
use serde::Serialize;
use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::Result;
use crate::models::CombinationKey;
use crate::processors::batch::RunManifest;
use crate::processors::statistics::StatisticsRecord;
use crate::processors::trends::TrendRecord;
use crate::utils::constants::{MANIFEST_FILE, STATS_DIR, TRENDS_DIR};

/// JSON output of a run: statistics and trend records per combination plus
/// the run manifest.
pub struct ResultsWriter {
    basedir: PathBuf,
    pretty: bool,
}

impl ResultsWriter {
    pub fn new(basedir: &Path) -> Self {
        Self {
            basedir: basedir.to_path_buf(),
            pretty: true,
        }
    }

    pub fn with_pretty(mut self, pretty: bool) -> Self {
        self.pretty = pretty;
        self
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn statistics_path(&self, key: &CombinationKey) -> PathBuf {
        self.basedir.join(STATS_DIR).join(format!("{}.json", key.file_stem()))
    }

    pub fn trends_path(&self, key: &CombinationKey) -> PathBuf {
        self.basedir.join(TRENDS_DIR).join(format!("{}.json", key.file_stem()))
    }

    pub fn manifest_path(&self) -> PathBuf {
        self.basedir.join(MANIFEST_FILE)
    }

    pub fn write_statistics(&self, key: &CombinationKey, records: &[StatisticsRecord]) -> Result<PathBuf> {
        let path = self.statistics_path(key);
        self.write_json(&path, &records)?;
        Ok(path)
    }

    pub fn write_trends(&self, key: &CombinationKey, records: &[TrendRecord]) -> Result<PathBuf> {
        let path = self.trends_path(key);
        self.write_json(&path, &records)?;
        Ok(path)
    }

    pub fn write_manifest(&self, manifest: &RunManifest) -> Result<PathBuf> {
        let path = self.manifest_path();
        self.write_json(&path, manifest)?;
        Ok(path)
    }

    pub fn read_statistics(&self, key: &CombinationKey) -> Result<Vec<StatisticsRecord>> {
        read_json(&self.statistics_path(key))
    }

    pub fn read_trends(&self, key: &CombinationKey) -> Result<Vec<TrendRecord>> {
        read_json(&self.trends_path(key))
    }

    pub fn read_manifest(&self) -> Result<RunManifest> {
        read_json(&self.manifest_path())
    }

    /// Delete all JSON output of previous runs. Returns the number of files
    /// removed.
    pub fn clear(&self) -> Result<usize> {
        let mut removed = 0;
        for dir in [STATS_DIR, TRENDS_DIR] {
            let dir = self.basedir.join(dir);
            if !dir.is_dir() {
                continue;
            }
            for entry in fs::read_dir(&dir)? {
                let path = entry?.path();
                if path.extension().is_some_and(|ext| ext == "json") {
                    fs::remove_file(&path)?;
                    removed += 1;
                }
            }
        }
        let manifest = self.manifest_path();
        if manifest.is_file() {
            fs::remove_file(&manifest)?;
            removed += 1;
        }
        debug!(basedir = %self.basedir.display(), removed, "previous JSON output cleared");
        Ok(removed)
    }

    fn write_json<T: Serialize + ?Sized>(&self, path: &Path, value: &T) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let tmp = path.with_extension("json.tmp");
        {
            let mut writer = BufWriter::new(File::create(&tmp)?);
            if self.pretty {
                serde_json::to_writer_pretty(&mut writer, value)?;
            } else {
                serde_json::to_writer(&mut writer, value)?;
            }
            writer.flush()?;
        }
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let reader = BufReader::new(File::open(path)?);
    Ok(serde_json::from_reader(reader)?)
}
