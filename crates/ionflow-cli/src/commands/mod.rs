//! CLI command implementations.

pub mod cancel;
pub mod common;
pub mod resubmit;
pub mod serve;
pub mod status;
pub mod submit;
