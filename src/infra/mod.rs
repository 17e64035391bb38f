//! Infrastructure adapters and runtime bootstrap.

pub mod chromium;
pub mod error;
pub mod http;
pub mod telemetry;
