pub mod config;
pub mod error;
pub mod evidence;
pub mod metrics;
pub mod pipeline;
pub mod resilience;
pub mod server;
pub mod shutdown;
pub mod verify;
pub mod workflow;
