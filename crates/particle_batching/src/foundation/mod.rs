//! Foundation module - Core utilities and types
//!
//! Small building blocks shared by the batching pipeline:
//! - Math types (nalgebra aliases, bounding boxes, frustums)
//! - Typed slot-map keys for caches and pooled buffers
//! - Stopwatch used to pace garbage collection
//! - Logging setup

pub mod collections;
pub mod logging;
pub mod math;
pub mod time;
