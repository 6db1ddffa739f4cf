pub mod api;
pub mod cache;
pub mod clock;
pub mod config;
pub mod error;
pub mod generator;
pub mod queue;
pub mod rate_limit;
pub mod resilience;
pub mod service;
pub mod storage;
pub mod sweep;
