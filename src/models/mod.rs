pub mod colocated;
pub mod frequency;
pub mod period;
pub mod region;
pub mod site;
pub mod timeseries;
pub mod variable;

pub use colocated::{ArtifactKey, ColocatedDataset, ColocatedPair, CombinationKey, PairedValue};
pub use frequency::Frequency;
pub use period::Period;
pub use region::{Region, RegionBounds, RegionFilter, RegionRegistry, RegionShape, RegionsHow};
pub use site::Site;
pub use timeseries::{Sample, SeriesMeta, TimeSeries};
pub use variable::{Variable, VariableRegistry, VerticalType};
