//! Operational HTTP listener: Prometheus metrics and health checks.

pub mod handler;
