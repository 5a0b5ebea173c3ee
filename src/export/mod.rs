//! Self-observability for the probe process.

pub mod health;
