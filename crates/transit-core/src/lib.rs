//! Core types for transit.
//!
//! This crate provides the error taxonomy and configuration shared by the
//! storage backends and the operations engine.

mod config;
mod error;

pub use config::{TransferConfig, TransferConfigBuilder};
pub use error::{ErrorKind, OperationError, TransferError, TransferResult};
