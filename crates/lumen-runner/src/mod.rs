pub mod logging;
pub mod region;

pub use logging::init_logging;
pub use region::{ChatChannel, DirectoryAssets, Region, RegionConfig, RegionFaults};
