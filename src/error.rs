//! Error types for audiopipe.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum PipelineError {
    // Build errors: reported synchronously, no partial graph persists
    #[error("Build error: {message}")]
    Build { message: String },

    // Mutation errors: the live pipeline is left unchanged
    #[error("Pipeline not found: {id}")]
    PipelineNotFound { id: String },

    #[error("Stage not found: {id}")]
    StageNotFound { id: String },

    #[error("Stage '{id}' has no upstream or no downstream and cannot be removed")]
    StageNotRemovable { id: String },

    #[error("Stage kind '{kind}' has no hot-updatable parameters matching the request")]
    UnsupportedPatch { kind: String },

    // Collaborator wiring
    #[error("No {service} service configured (required by '{element}')")]
    MissingService { service: String, element: String },

    // Audio processing errors
    #[error("Audio error: {message}")]
    Audio { message: String },

    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("WAV error: {0}")]
    Wav(#[from] hound::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Other(String),
}

impl PipelineError {
    /// Build-time failure with a descriptive message.
    pub fn build(message: impl Into<String>) -> Self {
        PipelineError::Build {
            message: message.into(),
        }
    }

    pub fn unknown_element(kind: &str) -> Self {
        Self::build(format!("Unknown pipeline element: {kind}"))
    }

    pub fn bad_position(kind: &str, detail: &str) -> Self {
        Self::build(format!("Element '{kind}' {detail}"))
    }

    pub fn bad_input(kind: &str, wants: &str, got: &str) -> Self {
        Self::build(format!("Element '{kind}' requires {wants} upstream, got {got}"))
    }

    pub fn missing_param(kind: &str, usage: &str) -> Self {
        Self::build(format!("Element '{kind}' is missing a parameter (usage: {usage})"))
    }

    pub fn bad_param(kind: &str, param: &str, detail: &str) -> Self {
        Self::build(format!("Element '{kind}': invalid parameter '{param}': {detail}"))
    }
}

// Type alias for convenience
pub type Result<T> = std::result::Result<T, PipelineError>;
