use thiserror::Error;

/// Failures that prevent a session from starting.
///
/// Only these surface to whoever called `start`; every other failure is
/// recovered inside the loop that saw it.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("capture device unavailable: {0:#}")]
    CaptureUnavailable(anyhow::Error),

    #[error("output sink unavailable: {0:#}")]
    OutputUnavailable(anyhow::Error),

    #[error("invalid output dimensions {width}x{height}")]
    InvalidDimensions { width: u32, height: u32 },
}

/// A single frame could not be copied into the accelerated frame texture.
#[derive(Debug, Error)]
pub enum UploadError {
    #[error("frame is {actual:?}, texture expects {expected:?}")]
    SizeMismatch {
        expected: (u32, u32),
        actual: (u32, u32),
    },

    #[error("frame has no pixels")]
    EmptyFrame,

    #[error("device rejected upload: {0}")]
    Device(String),
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}
