//! audiopipe - Streaming audio pipeline engine
//!
//! Pull-based stage graphs with automatic format bridging, fan-in
//! mixing, fan-out tees, and live mutation of running pipelines.

#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]
#![warn(clippy::let_underscore_must_use)]

pub mod builder;
pub mod cell;
pub mod config;
pub mod convert;
pub mod defaults;
pub mod error;
pub mod format;
pub mod io;
pub mod live;
pub mod mixer;
pub mod services;
pub mod stage;
pub mod stages;
pub mod tee;

// Core types (chunks flow source → processors → sink)
pub use format::{AudioFormat, Encoding};
pub use stage::{Chunk, FeedItem, Produce, Stage, StageCx, StageRef, connect, drain};

// Combinators
pub use mixer::{AudioMixer, MixerInput, MixerSource};
pub use tee::{AudioTee, TeeStage};

// Building and running
pub use builder::{BuiltElement, BuiltPipeline, PipelineBuilder, PipelineRun, ValueKind};
pub use cell::CellRunner;
pub use live::{LivePipeline, PipelineRegistry, PipelineState};

// Collaborators
pub use services::{Services, Synthesizer, Transcriber, VoiceConverter};
pub use stages::{Control, TranscriptEvent};

// Error handling
pub use error::{PipelineError, Result};

// Config
pub use config::EngineConfig;
