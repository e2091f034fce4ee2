//! Library entrypoint: re‑export modules

pub mod config;
pub mod errors;
pub mod http;
pub mod metrics;
pub mod model;
pub mod partition;
pub mod pipeline;
pub mod scanner;
pub mod sink;
pub mod source;
pub mod state;
pub mod store;
