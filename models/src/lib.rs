pub mod constants;
pub mod node;
pub mod status;
pub mod telemetry;
