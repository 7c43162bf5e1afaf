//! Resource pressure detection and graduated cleanup.

mod controller;
mod level;
mod policy;
mod sampler;

pub use controller::{
    CONNECTION_FOOTPRINT_BYTES, CleanupReport, EVICTED_UNDER_PRESSURE, EXECUTION_FOOTPRINT_BYTES,
    QUEUED_FRAME_FOOTPRINT_BYTES, ResourcePressureController,
};
pub use level::PressureLevel;
pub use sampler::{ProcessSampler, ResourceSample, ResourceSampler};
