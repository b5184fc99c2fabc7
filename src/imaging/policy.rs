//! Image size policy
//!
//! Maps accelerator memory capacity to the largest image side inference
//! is allowed to see.

/// Longest side used when no accelerator is present
pub const DEFAULT_MAX_SIDE: u32 = 640;

/// A single rule: capacities strictly below `below_mb` map to `max_side`.
/// `None` marks the catch-all rule.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SizeRule {
    pub below_mb: Option<f64>,
    pub max_side: u32,
}

/// Ordered rule table; the first matching rule wins
#[derive(Debug, Clone, Copy)]
pub struct SizePolicy {
    rules: &'static [SizeRule],
}

/// The policy every pipeline uses
pub static SIZE_POLICY: SizePolicy = SizePolicy {
    rules: &[
        SizeRule {
            below_mb: Some(4500.0),
            max_side: 640,
        },
        SizeRule {
            below_mb: Some(7000.0),
            max_side: 960,
        },
        SizeRule {
            below_mb: None,
            max_side: 1280,
        },
    ],
};

impl SizePolicy {
    /// Largest allowed image side for a capacity reading in MB
    pub fn max_side(&self, capacity_mb: Option<f64>) -> u32 {
        let Some(capacity) = capacity_mb else {
            return DEFAULT_MAX_SIDE;
        };

        self.rules
            .iter()
            .find(|rule| rule.below_mb.map_or(true, |bound| capacity < bound))
            .map(|rule| rule.max_side)
            .unwrap_or(DEFAULT_MAX_SIDE)
    }

    pub fn rules(&self) -> &'static [SizeRule] {
        self.rules
    }
}

/// Shorthand for `SIZE_POLICY.max_side`
pub fn max_side(capacity_mb: Option<f64>) -> u32 {
    SIZE_POLICY.max_side(capacity_mb)
}
