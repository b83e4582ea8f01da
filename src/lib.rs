pub mod client;
pub mod config;
pub mod housekeeping;
pub mod logging;
pub mod orchestrator;
pub mod server;
pub mod shutdown;
pub mod storage;
pub mod wire;
