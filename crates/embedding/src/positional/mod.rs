//! Rotary positional embedding engine.

pub mod cache;
pub mod rope;
pub mod scaling;

pub use cache::{RotaryState, RotaryStats};
pub use rope::{
    build_tables, inverse_rotate, rotate, QkLayout, RopeConfig, RotaryWrite, RotationStyle,
};
pub use scaling::{Frequencies, RopeScaling};
