//! CoLExT device agent: per-client telemetry pipeline and network-condition
//! coordinator for a federated-learning testbed.
//!
//! The library exposes the pipeline pieces so FL integrations can embed the
//! monitor wrappers directly; the binary wires them into a standalone agent.

pub mod config;
pub mod manager;
pub mod metrics;
pub mod monitor;
pub mod network;
pub mod scraper;
pub mod store;
