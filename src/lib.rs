pub mod backoff;
pub mod cli;
pub mod config;
pub mod error;
pub mod health;
pub mod k8s;
pub mod metrics;
pub mod normalize;
pub mod operator;
pub mod parser;
pub mod pipeline;
pub mod rotate;
pub mod server;
pub mod source;

pub use error::{OfficerError, Result};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
