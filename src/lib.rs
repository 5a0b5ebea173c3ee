//! cprobe: scrapes metric targets through protocol plugins and ships the
//! samples to Prometheus remote-write endpoints.

pub mod agent;
pub mod cache;
pub mod clock;
pub mod config;
pub mod discovery;
pub mod export;
pub mod metric;
pub mod plugin;
pub mod relabel;
pub mod scrape;
pub mod sink;
