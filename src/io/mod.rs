//! File and terminal transports.

pub mod cli;
pub mod file;

pub use cli::{CliRawSink, CliTextSink, CliTextSource};
pub use file::{FileRecorder, FileSource};
