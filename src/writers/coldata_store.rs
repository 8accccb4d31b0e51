use arrow::array::*;
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use chrono::DateTime;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::arrow::ArrowWriter;
use parquet::basic::{Compression, GzipLevel};
use parquet::file::properties::WriterProperties;
use std::collections::HashMap;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::debug;

use crate::error::{ProcessingError, Result};
use crate::models::{ArtifactKey, ColocatedDataset, ColocatedPair, PairedValue, Site, VerticalType};
use crate::utils::constants::{COLDATA_EXTENSION, DEFAULT_ROW_GROUP_SIZE};

const META_KEY: &str = "aeroval.key";
const META_UNIT: &str = "aeroval.unit";
const META_VERTICAL_TYPE: &str = "aeroval.vertical_type";
const META_COLOCATE_TIME: &str = "aeroval.colocate_time";

/// Result of a store attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreOutcome {
    Written,
    /// Another writer stored the same key first; nothing was written.
    AlreadyPresent,
}

/// Write-once Parquet store of colocated datasets, one file per artifact key.
pub struct ColocatedDataStore {
    basedir: PathBuf,
    compression: Compression,
    row_group_size: usize,
    write_lock: Mutex<()>,
}

impl ColocatedDataStore {
    pub fn new(basedir: &Path) -> Self {
        Self {
            basedir: basedir.to_path_buf(),
            compression: Compression::SNAPPY,
            row_group_size: DEFAULT_ROW_GROUP_SIZE,
            write_lock: Mutex::new(()),
        }
    }

    pub fn with_compression(mut self, compression: &str) -> Result<Self> {
        self.compression = match compression.to_lowercase().as_str() {
            "snappy" => Compression::SNAPPY,
            "gzip" => Compression::GZIP(GzipLevel::default()),
            "lz4" => Compression::LZ4,
            "zstd" => Compression::ZSTD(parquet::basic::ZstdLevel::default()),
            "none" => Compression::UNCOMPRESSED,
            _ => {
                return Err(ProcessingError::Config(format!(
                    "Unsupported compression: {}",
                    compression
                )))
            }
        };
        Ok(self)
    }

    pub fn basedir(&self) -> &Path {
        &self.basedir
    }

    pub fn path_for(&self, key: &ArtifactKey) -> PathBuf {
        let model_dir: String = key
            .model
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
            .collect();
        self.basedir
            .join(model_dir)
            .join(format!("{}.{}", key.file_stem(), COLDATA_EXTENSION))
    }

    pub fn exists(&self, key: &ArtifactKey) -> bool {
        self.path_for(key).is_file()
    }

    /// Persist `dataset` unless its key is already stored. The existence check
    /// and the write happen under one lock, and the file only appears under its
    /// final name once complete.
    pub fn store(&self, dataset: &ColocatedDataset) -> Result<StoreOutcome> {
        let path = self.path_for(&dataset.key);
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if path.is_file() {
            debug!(key = %dataset.key, "colocated artifact already present");
            return Ok(StoreOutcome::AlreadyPresent);
        }
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let tmp = path.with_extension(format!("{}.tmp", COLDATA_EXTENSION));
        if let Err(e) = self.write_file(dataset, &tmp) {
            let _ = fs::remove_file(&tmp);
            return Err(e);
        }
        fs::rename(&tmp, &path)?;
        debug!(key = %dataset.key, path = %path.display(), "colocated artifact written");
        Ok(StoreOutcome::Written)
    }

    pub fn load(&self, key: &ArtifactKey) -> Result<ColocatedDataset> {
        let path = self.path_for(key);
        let file = File::open(&path)?;
        let builder = ParquetRecordBatchReaderBuilder::try_new(file)?;
        let metadata = builder.schema().metadata().clone();

        let stored_key: ArtifactKey = serde_json::from_str(meta_value(&metadata, META_KEY)?)?;
        if &stored_key != key {
            return Err(ProcessingError::InvalidFormat(format!(
                "{} holds artifact {} instead of {}",
                path.display(),
                stored_key,
                key
            )));
        }
        let unit = meta_value(&metadata, META_UNIT)?.to_string();
        let vertical_type = match metadata.get(META_VERTICAL_TYPE) {
            Some(v) if !v.is_empty() => Some(v.parse::<VerticalType>()?),
            _ => None,
        };
        let colocate_time = meta_value(&metadata, META_COLOCATE_TIME)? == "true";

        let mut grouped: Vec<(Site, String, Vec<PairedValue>)> = Vec::new();
        for batch in builder.build()? {
            let batch = batch?;
            let site_ids = string_column(&batch, 0)?;
            let site_names = string_column(&batch, 1)?;
            let latitudes = float_column(&batch, 2)?;
            let longitudes = float_column(&batch, 3)?;
            let altitudes = float_column(&batch, 4)?;
            let countries = string_column(&batch, 5)?;
            let cells = string_column(&batch, 6)?;
            let times = batch
                .column(7)
                .as_any()
                .downcast_ref::<TimestampMillisecondArray>()
                .ok_or_else(|| ProcessingError::InvalidFormat("Invalid time column type".to_string()))?;
            let obs = float_column(&batch, 8)?;
            let model = float_column(&batch, 9)?;
            let weights = batch
                .column(10)
                .as_any()
                .downcast_ref::<UInt32Array>()
                .ok_or_else(|| ProcessingError::InvalidFormat("Invalid weight column type".to_string()))?;

            for i in 0..batch.num_rows() {
                let time = DateTime::from_timestamp_millis(times.value(i))
                    .map(|t| t.naive_utc())
                    .ok_or_else(|| {
                        ProcessingError::InvalidFormat(format!("timestamp {} out of range", times.value(i)))
                    })?;
                let row = PairedValue {
                    time,
                    obs: (!obs.is_null(i)).then(|| obs.value(i)),
                    model: (!model.is_null(i)).then(|| model.value(i)),
                    weight: weights.value(i),
                };
                let site_id = site_ids.value(i);
                let cell = cells.value(i);
                match grouped
                    .iter_mut()
                    .find(|(site, c, _)| site.id == site_id && c == cell)
                {
                    Some((_, _, rows)) => rows.push(row),
                    None => {
                        let mut site = Site::new(
                            site_id,
                            site_names.value(i),
                            latitudes.value(i),
                            longitudes.value(i),
                            altitudes.value(i),
                        );
                        if !countries.is_null(i) {
                            site = site.with_country(countries.value(i));
                        }
                        grouped.push((site, cell.to_string(), vec![row]));
                    }
                }
            }
        }

        let pairs = grouped
            .into_iter()
            .map(|(site, cell, rows)| ColocatedPair::new(site, &cell, key.frequency, rows))
            .collect::<Result<Vec<_>>>()?;

        Ok(ColocatedDataset {
            key: stored_key,
            unit,
            vertical_type,
            colocate_time,
            pairs,
        })
    }

    /// Remove every stored artifact. Returns the number of files deleted.
    pub fn delete_all(&self) -> Result<usize> {
        let _guard = self.write_lock.lock().unwrap_or_else(|e| e.into_inner());
        if !self.basedir.is_dir() {
            return Ok(0);
        }
        let removed = remove_artifacts(&self.basedir)?;
        debug!(basedir = %self.basedir.display(), removed, "colocated artifacts deleted");
        Ok(removed)
    }

    fn write_file(&self, dataset: &ColocatedDataset, path: &Path) -> Result<()> {
        let schema = self.create_schema(dataset)?;
        let batch = self.dataset_to_batch(dataset, schema.clone())?;

        let file = File::create(path)?;
        let props = WriterProperties::builder()
            .set_compression(self.compression)
            .set_max_row_group_size(self.row_group_size)
            .build();

        let mut writer = ArrowWriter::try_new(file, schema, Some(props))?;
        writer.write(&batch)?;
        writer.close()?;
        Ok(())
    }

    fn create_schema(&self, dataset: &ColocatedDataset) -> Result<Arc<Schema>> {
        let fields = vec![
            Field::new("site_id", DataType::Utf8, false),
            Field::new("site_name", DataType::Utf8, false),
            Field::new("latitude", DataType::Float64, false),
            Field::new("longitude", DataType::Float64, false),
            Field::new("altitude", DataType::Float64, false),
            Field::new("country", DataType::Utf8, true),
            Field::new("model_site_id", DataType::Utf8, false),
            Field::new("time", DataType::Timestamp(TimeUnit::Millisecond, None), false),
            Field::new("obs", DataType::Float64, true),
            Field::new("model", DataType::Float64, true),
            Field::new("weight", DataType::UInt32, false),
        ];

        let mut metadata = HashMap::new();
        metadata.insert(META_KEY.to_string(), serde_json::to_string(&dataset.key)?);
        metadata.insert(META_UNIT.to_string(), dataset.unit.clone());
        metadata.insert(
            META_VERTICAL_TYPE.to_string(),
            dataset
                .vertical_type
                .map(|v| v.to_string())
                .unwrap_or_default(),
        );
        metadata.insert(META_COLOCATE_TIME.to_string(), dataset.colocate_time.to_string());

        Ok(Arc::new(Schema::new_with_metadata(fields, metadata)))
    }

    fn dataset_to_batch(&self, dataset: &ColocatedDataset, schema: Arc<Schema>) -> Result<RecordBatch> {
        let rows: Vec<(&ColocatedPair, &PairedValue)> = dataset
            .pairs
            .iter()
            .flat_map(|pair| pair.rows().iter().map(move |row| (pair, row)))
            .collect();

        let site_ids: Vec<&str> = rows.iter().map(|(p, _)| p.site.id.as_str()).collect();
        let site_names: Vec<&str> = rows.iter().map(|(p, _)| p.site.name.as_str()).collect();
        let latitudes: Vec<f64> = rows.iter().map(|(p, _)| p.site.latitude).collect();
        let longitudes: Vec<f64> = rows.iter().map(|(p, _)| p.site.longitude).collect();
        let altitudes: Vec<f64> = rows.iter().map(|(p, _)| p.site.altitude).collect();
        let countries: Vec<Option<&str>> = rows.iter().map(|(p, _)| p.site.country.as_deref()).collect();
        let cells: Vec<&str> = rows.iter().map(|(p, _)| p.model_site_id.as_str()).collect();
        let times: Vec<i64> = rows.iter().map(|(_, r)| r.time.and_utc().timestamp_millis()).collect();
        let obs: Vec<Option<f64>> = rows.iter().map(|(_, r)| r.obs).collect();
        let model: Vec<Option<f64>> = rows.iter().map(|(_, r)| r.model).collect();
        let weights: Vec<u32> = rows.iter().map(|(_, r)| r.weight).collect();

        let batch = RecordBatch::try_new(
            schema,
            vec![
                Arc::new(StringArray::from(site_ids)),
                Arc::new(StringArray::from(site_names)),
                Arc::new(Float64Array::from(latitudes)),
                Arc::new(Float64Array::from(longitudes)),
                Arc::new(Float64Array::from(altitudes)),
                Arc::new(StringArray::from(countries)),
                Arc::new(StringArray::from(cells)),
                Arc::new(TimestampMillisecondArray::from(times)),
                Arc::new(Float64Array::from(obs)),
                Arc::new(Float64Array::from(model)),
                Arc::new(UInt32Array::from(weights)),
            ],
        )?;
        Ok(batch)
    }
}

fn meta_value<'m>(metadata: &'m HashMap<String, String>, key: &str) -> Result<&'m str> {
    metadata
        .get(key)
        .map(String::as_str)
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("artifact metadata lacks '{}'", key)))
}

fn string_column(batch: &RecordBatch, index: usize) -> Result<&StringArray> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("column {} is not a string column", index)))
}

fn float_column(batch: &RecordBatch, index: usize) -> Result<&Float64Array> {
    batch
        .column(index)
        .as_any()
        .downcast_ref::<Float64Array>()
        .ok_or_else(|| ProcessingError::InvalidFormat(format!("column {} is not a float column", index)))
}

fn remove_artifacts(dir: &Path) -> Result<usize> {
    let mut removed = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.is_dir() {
            removed += remove_artifacts(&path)?;
        } else if path.extension().is_some_and(|ext| ext == COLDATA_EXTENSION || ext == "tmp") {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    Ok(removed)
}
