//! Coordinator library: framed transport, worker registry, connection
//! handler, model config loader, layer partitioner, dispatch engine,
//! stats collector, and orchestrator. `main.rs` is a thin CLI shell
//! around `orchestrator::run`.

pub mod config;
pub mod dispatch;
pub mod error;
pub mod handler;
pub mod input;
pub mod model;
pub mod orchestrator;
pub mod partition;
pub mod registry;
pub mod stats;
pub mod transport;

pub use error::{CoordinatorError, Result};
