//! Container resource sampling library
//!
//! This crate provides the core functionality for:
//! - Sampling CPU and memory usage from the Docker engine or a Kubernetes cluster
//! - Converting Kubernetes resource quantities
//! - Appending samples to a CSV file on a fixed interval
//! - Health checks and observability

pub mod api;
pub mod collector;
pub mod health;
pub mod models;
pub mod observability;
pub mod quantity;
pub mod sink;

pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{SamplerMetrics, StructuredLogger};
pub use sink::{SampleSink, SinkError};
