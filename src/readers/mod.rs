pub mod concurrent_reader;
pub mod csv_reader;
pub mod provider;

pub use concurrent_reader::ConcurrentReader;
pub use csv_reader::SeriesCsvReader;
pub use provider::{InMemoryCatalog, SeriesProvider, SourceKind};
