//! shyLLM Server - HTTP front-end for a text-generation pipeline
//!
//! The binary finds a free port, then serves the [`api`] router on it.

pub mod api;
pub mod bootstrap;
pub mod config;
pub mod error;
pub mod logging;
pub mod ports;
pub mod reload;

pub use api::{router, AppState};
pub use bootstrap::{conclude, run_server, BootstrapError, Conclusion, ServeOptions, ServeReport};
pub use config::ServerConfig;
pub use error::ApiError;
pub use ports::{PortFinder, PortProbe, PortSource, TcpProbe};
