//! # Creator Hub Common Library
//!
//! Shared code for the Creator Hub services including:
//! - Domain models and SQLite schema initialization
//! - Event types (ChubEvent enum) and EventBus
//! - Configuration loading
//! - SSE helpers

pub mod config;
pub mod db;
pub mod error;
pub mod events;
pub mod sse;

pub use error::{Error, Result};
