use std::env;
use std::ffi::CString;

use thiserror::Error;

pub const DEFAULT_MAX_DEPTH: usize = 255;

pub const MAX_DEPTH_VAR: &str = "CRASHTRACE_MAX_DEPTH";
pub const OUTPUT_VAR: &str = "CRASHTRACE_OUTPUT";

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("invalid maximum depth {0:?}")]
    InvalidMaxDepth(String),
    #[error("output path contains a NUL byte")]
    NulInPath,
}

/// Where a report triggered by [`crate::report`] is written.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Output {
    Stderr,
    /// Appended to, and created with mode 0644 if missing.
    File(CString),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Config {
    /// Frames are emitted while the frame index is at most this value.
    pub max_depth: usize,
    pub output: Output,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_depth: DEFAULT_MAX_DEPTH,
            output: Output::Stderr,
        }
    }
}

impl Config {
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn with_output_file(mut self, path: impl Into<Vec<u8>>) -> Result<Self, ConfigError> {
        self.output = Output::File(CString::new(path).map_err(|_| ConfigError::NulInPath)?);
        Ok(self)
    }

    /// Reads `CRASHTRACE_MAX_DEPTH` and `CRASHTRACE_OUTPUT`, keeping the
    /// defaults for anything unset. An output of `-` means stderr.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(depth) = lookup(MAX_DEPTH_VAR) {
            config.max_depth = depth
                .trim()
                .parse()
                .map_err(|_| ConfigError::InvalidMaxDepth(depth.clone()))?;
        }
        match lookup(OUTPUT_VAR) {
            Some(path) if !path.is_empty() && path != "-" => config.with_output_file(path),
            _ => Ok(config),
        }
    }
}
