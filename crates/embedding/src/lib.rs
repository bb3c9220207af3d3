//! Embedding crate
//!
//! The positional module owns rotary tables, their growth policy and the
//! layout-aware rotation applied to query/key projections.

pub mod positional;

pub use positional::*;
