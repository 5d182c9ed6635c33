pub mod config;
mod coordinator;
mod error;
mod log_shipper;
mod ports;

pub use config::{DynamicConfig, NodeConfig, StaticConfig};
pub use coordinator::Coordinator;
pub use error::Error;
