//! Shared data types

pub mod record;

pub use record::{LogRecord, LogValue};
