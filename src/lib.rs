//! sensorbridge: relays MQTT sensor readings into MySQL and a durable RabbitMQ
//! queue, flagging anomalous values on the way.
//!
//! ## Modules
//!
//! * `config`: TOML configuration with environment overrides, validated with
//!   the `validator` crate.
//!
//! * `core`: The message pipeline:
//!   - Reading model and outbound message
//!   - Anomaly rule table
//!   - MySQL persistence gateway
//!   - Per-message relay and the bounded dispatcher
//!   - Readiness of the two broker links
//!
//! * `logger`: Centralized logging initialization using `tracing`.
//!   Supports console output in multiple formats (compact, pretty, JSON)
//!   and optional systemd journald integration.
//!
//! The broker links themselves live in the `sensorbridge-transport` crate.

pub mod config;
pub mod core;
pub mod logger;
