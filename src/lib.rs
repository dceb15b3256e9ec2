pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod errors;
pub mod executor;
pub mod latency;
pub mod metrics;
pub mod registry;
pub mod scheduler;
pub mod server;
pub mod stats;
pub mod system;
pub mod transport;
pub mod utils;
