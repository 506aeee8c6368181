//! Frame ingestion sources.
//!
//! This module provides finite frame sources for the detection loop:
//! - `stub://` synthetic scenes (testing, dry runs)
//! - Local image directories, one frame per file (feature: ingest-images)
//!
//! Every source reports end-of-stream as `Ok(None)`; the frame loop treats
//! that as normal termination.

pub mod file;

pub use file::FileSource;
