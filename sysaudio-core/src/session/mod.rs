pub mod cancellation;
pub mod controller;
pub mod postprocess;
pub mod recorder;
