//! Asynchronous HLS transcoding for uploaded videos

pub mod encoder;
pub mod error;
pub mod playlist;
pub mod rendition;
pub mod worker;

pub use encoder::{write_placeholder, Encoder, FfmpegEncoder};
pub use error::StepError;
pub use rendition::{Rendition, RENDITIONS};
pub use worker::{JobReport, RenditionOutcome, RenditionReport, TranscodeWorker, WorkerSettings};
