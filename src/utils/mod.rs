//! Utility modules.

pub mod debug;

pub use debug::{init_debug_logging, ERT_DEBUG_ENV};
