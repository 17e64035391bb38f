//! Application services layer.

pub mod conversion;
pub mod engine;
pub mod error;
pub mod lifecycle;
