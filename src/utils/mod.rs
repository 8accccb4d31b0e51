pub mod constants;
pub mod coordinates;
pub mod progress;

pub use constants::*;
pub use coordinates::haversine_distance;
pub use progress::ProgressReporter;
