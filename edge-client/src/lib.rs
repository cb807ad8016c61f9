//! Edge node for the AI Carpool network: registers with the central server,
//! keeps a control channel open, reports load and health, and proxies AI
//! requests to upstream providers.

pub mod central_client;
pub mod client;
pub mod config;
pub mod config_sync;
pub mod crypto;
pub mod error;
pub mod logging;
pub mod net;
pub mod proxy;
pub mod reporters;
pub mod session;
pub mod types;

pub use client::{EdgeClient, RunningClient};
pub use config::EdgeConfig;
