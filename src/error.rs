use thiserror::Error;

pub type Result<T> = std::result::Result<T, ProcessingError>;

#[derive(Error, Debug)]
pub enum ProcessingError {
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("CSV parsing error: {0}")]
    Csv(#[from] csv::Error),

    #[error("Date parsing error: {0}")]
    DateParse(#[from] chrono::ParseError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] config::ConfigError),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Validation error: {0}")]
    Validation(#[from] validator::ValidationErrors),

    #[error("No conversion factor from '{from}' to '{to}'")]
    UnitConversion { from: String, to: String },

    #[error("Missing input variable '{variable}' for {source_id}")]
    MissingInputVariable { variable: String, source_id: String },

    #[error("Colocation mismatch: {0}")]
    ColocationMismatch(String),

    #[error("Invalid coordinate: {0}")]
    InvalidCoordinate(String),

    #[error("Invalid data format: {0}")]
    InvalidFormat(String),

    #[error("Batch aborted after failure in {combination}: {message}")]
    BatchAborted {
        combination: String,
        message: String,
    },

    #[error("Async task error: {0}")]
    TaskJoin(#[from] tokio::task::JoinError),
}

impl ProcessingError {
    pub fn config(message: impl Into<String>) -> Self {
        ProcessingError::Config(message.into())
    }

    pub fn missing_input(variable: &str, source_id: &str) -> Self {
        ProcessingError::MissingInputVariable {
            variable: variable.to_string(),
            source_id: source_id.to_string(),
        }
    }
}
