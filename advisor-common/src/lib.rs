//! Advisor Common - Shared configuration, errors, and logging for the advisor relay.
//!
//! This crate provides:
//! - Configuration types and layered loading (defaults, JSON file, environment)
//! - The unified error type
//! - Logging setup and request trace context
//! - Small string utilities used when logging prompts

#![warn(clippy::all)]
#![allow(clippy::pedantic)]

pub mod config;
pub mod error;
pub mod logging;
pub mod util;

pub use config::{
    Config, LlmConfig, NetworkConfig, ObservabilityConfig, SecretsConfig, SessionsConfig,
};
pub use error::{Error, Result};
