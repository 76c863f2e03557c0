//! # Core Runtime Module
//!
//! Foundational runtime infrastructure for the display sync daemon:
//! - Logging and tracing infrastructure
//! - Configuration management
//! - Internal event bus
//!
//! ## Overview
//!
//! Every other crate in the workspace builds on the conventions set here:
//! components receive a [`config::CoreConfig`] instead of reading globals,
//! log through `tracing` with structured fields, and report progress on the
//! [`events::EventBus`].

pub mod config;
pub mod error;
pub mod events;
pub mod logging;

pub use error::{Error, Result};
