//! Utility functions for formatting sizes and truncating text.

pub mod format;

pub use format::{format_bytes, format_progress, truncate_string};
