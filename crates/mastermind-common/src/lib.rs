//! Mastermind Common - Shared types and utilities
//!
//! This crate provides the value types, configuration and error
//! definitions shared by the mastermind metadata client and its tools.

pub mod config;
pub mod error;
pub mod types;

pub use config::{ControllerConfig, ThresholdConfig};
pub use error::{Error, Result, RpcError};
pub use types::*;
