//! Layer-7 load balancer with real-time DDoS detection and mitigation.

pub mod api;
pub mod config;
pub mod core;
pub mod error;
pub mod models;
pub mod utils;
