//! Live video analytics pipeline: capture, inference, tracking, per-track
//! analytics, and an annotated MJPEG output stream, orchestrated as staged
//! worker threads behind an HTTP control surface.

mod annotation;
pub mod config;
pub mod data;
mod health;
mod loiter;
pub mod pipeline;
pub mod queue;
pub mod server;
mod speed;
mod stages;
pub mod store;
pub mod telemetry;
