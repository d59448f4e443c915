//! Types shared between the imagebake library and its front ends.

pub mod errors;

pub use errors::{BakeError, BakeResult};
