//! Message pipeline: reading model, classification, storage, relay and dispatch.

pub mod classifier;
pub mod dispatcher;
pub mod persistence;
pub mod readiness;
pub mod reading;
pub mod relay;
