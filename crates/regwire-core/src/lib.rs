//! # regwire-core
//!
//! Core types and contracts for talking to container registries.
//!
//! This crate provides the foundational pieces shared by regwire clients:
//! the error taxonomy, client options, per-host registry configuration, and
//! the throttle and credential contracts that embedders implement.
//!
//! ## Modules
//!
//! - [`error`] - Error types and HTTP status code mapping
//! - [`config`] - Client-wide options and transport template settings
//! - [`host`] - Per-registry host configuration and the lookup contract
//! - [`throttle`] - Priority-aware concurrency limiting contract
//! - [`credential`] - Registry credential records and providers

#![deny(missing_docs)]
#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]

pub mod config;
pub mod credential;
pub mod error;
pub mod host;
pub mod throttle;

// Re-export commonly used types
pub use error::{Error, Result};
