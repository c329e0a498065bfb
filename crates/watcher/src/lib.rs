//! Wiring for the metric-watcher binary: settings and the HTTP API

pub mod api;
pub mod config;
