//! Engine assembly
//!
//! This module provides:
//! - [`EngineConfig`] and the identifier limits every manager validates against
//! - The shared context handed to every manager
//! - The router that applies transport pushes in delivery order
//! - The [`Engine`] facade and its builder

pub mod config;
pub(crate) mod context;
pub mod facade;
mod router;

pub use config::{EngineConfig, IdLimits};
pub(crate) use context::EngineContext;
pub use facade::{Engine, EngineBuilder};
