//! Integration smoke tests for the embedding crate.

use embedding::positional::{RopeConfig, RopeScaling, RotaryState, RotationStyle};
use static_assertions::assert_impl_all;

assert_impl_all!(RotaryState: Send, Sync);
assert_impl_all!(RopeConfig: Send, Sync, Clone);

#[test]
fn positional_module_exposes_defaults() {
    let config = RopeConfig::default();
    assert_eq!(config.head_dim, 0);
    assert_eq!(config.rope_theta, 10_000.0);
    assert_eq!(config.rotate_dim, None);
    assert_eq!(config.style, RotationStyle::Half);
    assert!(matches!(config.scaling, RopeScaling::Default));
}
