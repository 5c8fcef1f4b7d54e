//! Streaming tile super-resolution: the upscale pipeline, its inference
//! engines and the HTTP surface that serves it.

pub mod backend;
pub mod config;
pub mod error;
pub mod inference;
pub mod logging;
pub mod pipeline;
pub mod server;
pub mod tile;

pub use error::PipelineError;
