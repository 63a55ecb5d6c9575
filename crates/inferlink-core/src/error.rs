//! Error taxonomy for inferlink.
//!
//! Validation problems are detected before the engine is touched and come back
//! as [`InferError::ParamNull`], [`InferError::AllocFailed`] or
//! [`InferError::Failed`]. Anything the engine itself reports is wrapped in
//! [`InferError::Engine`] and handed to the caller; nothing in this crate
//! terminates the process.

use std::fmt;
use std::path::PathBuf;

use thiserror::Error;

use crate::tensor::TensorSet;

/// Result type alias for inferlink operations.
pub type Result<T> = std::result::Result<T, InferError>;

/// The engine call that produced a fault.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineStage {
    CreateEnvironment,
    OpenSession,
    Introspect,
    Run,
}

impl fmt::Display for EngineStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::CreateEnvironment => "creating the environment",
            Self::OpenSession => "opening the session",
            Self::Introspect => "reading node metadata",
            Self::Run => "running inference",
        };
        f.write_str(s)
    }
}

/// Errors returned by tensor, session and runtime operations.
#[derive(Debug, Error)]
pub enum InferError {
    /// A required argument was absent or empty.
    #[error("Required parameter missing: {0}")]
    ParamNull(&'static str),

    /// A tensor buffer could not be allocated.
    #[error("Tensor allocation failed for `{name}` ({bytes} bytes)")]
    AllocFailed { name: String, bytes: usize },

    /// Boundary validation failed; the engine was not invoked.
    #[error("Validation failed: {0}")]
    Failed(String),

    /// The session is not in a state that allows the operation.
    #[error("Invalid session state: cannot {op} while {state}")]
    InvalidState { op: &'static str, state: String },

    /// The inference engine reported a failure.
    #[error("Engine fault while {stage}: {source:#}")]
    Engine {
        stage: EngineStage,
        #[source]
        source: anyhow::Error,
    },

    /// Model decryption failed.
    #[error("Model decryption failed: {0}")]
    Decrypt(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Model file not found.
    #[error("File not found: {}", .0.display())]
    FileNotFound(PathBuf),

    /// JSON parsing error.
    #[error("JSON parsing error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error.
    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Coarse classification of an [`InferError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ParamNull,
    AllocFailed,
    Failed,
    Engine,
    ModelLoad,
}

/// Numeric status codes for embedders that report plain integers.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultCode {
    Success = 0,
    Failed = 1,
    ParamNull = 2,
    ParamSetError = 3,
    FileNotExist = 4,
    MemoryMallocFailed = 5,
    ModelLoadFailed = 6,
    TensorAllocFailed = 7,
    EngineFault = 8,
}

impl InferError {
    /// Create a validation failure.
    pub fn failed(msg: impl Into<String>) -> Self {
        Self::Failed(msg.into())
    }

    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a decryption error.
    pub fn decrypt(msg: impl Into<String>) -> Self {
        Self::Decrypt(msg.into())
    }

    /// Wrap an engine-reported failure.
    pub fn engine(stage: EngineStage, source: anyhow::Error) -> Self {
        Self::Engine { stage, source }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::ParamNull(_) => ErrorKind::ParamNull,
            Self::AllocFailed { .. } => ErrorKind::AllocFailed,
            Self::Failed(_) | Self::InvalidState { .. } | Self::Config(_) => ErrorKind::Failed,
            Self::Engine { .. } => ErrorKind::Engine,
            Self::Decrypt(_)
            | Self::FileNotFound(_)
            | Self::Json(_)
            | Self::Yaml(_)
            | Self::Io(_) => ErrorKind::ModelLoad,
        }
    }

    pub fn code(&self) -> ResultCode {
        match self {
            Self::ParamNull(_) => ResultCode::ParamNull,
            Self::AllocFailed { .. } => ResultCode::TensorAllocFailed,
            Self::Failed(_) | Self::InvalidState { .. } => ResultCode::Failed,
            Self::Config(_) | Self::Json(_) | Self::Yaml(_) => ResultCode::ParamSetError,
            Self::FileNotFound(_) => ResultCode::FileNotExist,
            Self::Engine { .. } => ResultCode::EngineFault,
            Self::Decrypt(_) | Self::Io(_) => ResultCode::ModelLoadFailed,
        }
    }

    /// True for engine faults, which callers usually treat as fatal for the session.
    pub fn is_engine_fault(&self) -> bool {
        matches!(self, Self::Engine { .. })
    }
}

/// A model that failed to load, with the tensor sets it was given.
///
/// The sets are still live in their arena; retry with them or pass them to
/// `Runtime::deinit_tensors`.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct LoadError {
    pub error: InferError,
    pub inputs: TensorSet,
    pub outputs: TensorSet,
}

impl LoadError {
    pub fn code(&self) -> ResultCode {
        self.error.code()
    }

    pub fn kind(&self) -> ErrorKind {
        self.error.kind()
    }

    pub fn into_parts(self) -> (InferError, TensorSet, TensorSet) {
        (self.error, self.inputs, self.outputs)
    }
}

impl From<LoadError> for InferError {
    fn from(err: LoadError) -> Self {
        err.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = InferError::failed("output name not found in model: missing");
        assert_eq!(
            format!("{}", err),
            "Validation failed: output name not found in model: missing"
        );

        let err = InferError::ParamNull("model_path");
        assert_eq!(format!("{}", err), "Required parameter missing: model_path");

        let err = InferError::FileNotFound(PathBuf::from("/models/net.onnx"));
        assert_eq!(format!("{}", err), "File not found: /models/net.onnx");
    }

    #[test]
    fn engine_faults_keep_their_stage() {
        let err = InferError::engine(EngineStage::Run, anyhow::anyhow!("kernel exploded"));
        assert!(err.is_engine_fault());
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(err.code(), ResultCode::EngineFault);
        assert_eq!(
            err.to_string(),
            "Engine fault while running inference: kernel exploded"
        );
    }

    #[test]
    fn codes_follow_kinds() {
        assert_eq!(InferError::ParamNull("x").code() as i32, 2);
        assert_eq!(InferError::failed("x").code() as i32, 1);
        let alloc = InferError::AllocFailed {
            name: "t".into(),
            bytes: 4,
        };
        assert_eq!(alloc.kind(), ErrorKind::AllocFailed);
        assert_eq!(alloc.code(), ResultCode::TensorAllocFailed);
    }
}
