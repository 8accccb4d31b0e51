pub mod coldata_store;
pub mod results_writer;

pub use coldata_store::{ColocatedDataStore, StoreOutcome};
pub use results_writer::ResultsWriter;
