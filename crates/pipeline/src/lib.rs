//! QRLP Pipeline
//!
//! Payload enhancement, verification and live generation on top of the
//! `qrlive-crypto` layers.

#![warn(missing_docs)]

pub mod error;
pub mod generator;
pub mod pipeline;

pub use error::{PipelineError, PipelineResult};
pub use generator::{GeneratorHandle, GeneratorStats, LiveGenerator, ObserverId, PayloadObserver, PayloadSource};
pub use pipeline::{DegradedLayer, EnhanceOptions, EnhanceOutcome, PayloadPipeline, PipelineBuilder, PipelineMetrics};
