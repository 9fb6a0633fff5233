pub mod binning;
pub mod features;
pub mod histogram;
pub mod isotonic;
pub mod metrics;
pub mod network;
pub mod ratio;
