//! Automated perpetual-futures trading platform.
//!
//! Exposes every module so integration tests (and the `futurepilot`
//! binary) can drive the core directly rather than through the HTTP
//! façade.

pub mod algo;
pub mod config;
pub mod domain;
pub mod error;
pub mod exchange;
pub mod http;
pub mod ingestor;
pub mod klines;
pub mod liquidation;
pub mod llm;
pub mod middleware;
pub mod orchestrator;
pub mod persistence;
pub mod scheduler;
pub mod strategy;
