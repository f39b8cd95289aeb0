//! cloudsql-runner - run one SQL statement against Cloud SQL through the Cloud SQL Auth Proxy.
//!
//! This library exposes the core modules for the binary and for integration tests.

pub mod cli;
pub mod config;
pub mod db;
pub mod error;
pub mod logging;
pub mod proxy;
pub mod runner;
pub mod server;
pub mod statement;
