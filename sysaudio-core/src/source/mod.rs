pub mod manager;
pub mod readiness;
pub mod synthetic;
