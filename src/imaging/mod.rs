//! Image sizing
//!
//! Picks a maximum image side from accelerator capacity and downsizes
//! inputs to fit it.

pub mod policy;
pub mod resize;

pub use policy::{max_side, SizePolicy, SizeRule, DEFAULT_MAX_SIDE, SIZE_POLICY};
pub use resize::{resize_max_side, target_dimensions};
