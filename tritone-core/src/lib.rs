pub mod config;
pub mod demux;
pub mod error;
pub mod frame;
pub mod http_client;
pub mod markdown;
pub mod model;
pub mod mux;
pub mod provider;
pub mod providers;
pub mod sanitize;
pub mod session;
pub mod telemetry;
