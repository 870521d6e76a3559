//! Status codes shared by every layer of the runtime.
//!
//! Every fallible operation returns [`Result`]; success carries no payload
//! beyond out-values. Callers branch on [`Status::kind`] and never need to
//! match on message text.

use std::fmt;

use thiserror::Error;

use crate::device::DeviceType;
use crate::layer::LayerType;

/// Coarse classification of a failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Backend runtime or context could not be initialised. Fatal.
    DeviceError,
    /// A device allocation failed.
    OutOfMemory,
    /// No kernel is registered for an (operator, device) pair.
    UnsupportedOperator,
    /// Input data types fall outside a kernel's promotion table.
    UnsupportedTypeCombination,
    /// A layout conversion or layout-dependent request cannot be served.
    UnsupportedFormat,
    /// An output shape could not be derived from inputs and parameters.
    ShapeInferenceError,
    /// A blob cannot take the requested shape with its current storage.
    ShapeError,
    /// The graph structure is malformed.
    GraphError,
    /// An optimizer pass could not rewrite the graph.
    OptimizerError,
    /// The backend lacks a capability needed for an otherwise valid request.
    DeviceNotSupported,
    /// No device is registered for the requested kind.
    UnknownDevice,
    /// A device or kernel was registered twice under the same key.
    DuplicateRegistration,
    /// The engine is not in a state that allows the operation.
    InvalidState,
    /// A caller supplied an invalid argument.
    ParamError,
    /// A kernel failed while executing.
    KernelError,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::DeviceError => "DeviceError",
            ErrorKind::OutOfMemory => "OutOfMemory",
            ErrorKind::UnsupportedOperator => "UnsupportedOperator",
            ErrorKind::UnsupportedTypeCombination => "UnsupportedTypeCombination",
            ErrorKind::UnsupportedFormat => "UnsupportedFormat",
            ErrorKind::ShapeInferenceError => "ShapeInferenceError",
            ErrorKind::ShapeError => "ShapeError",
            ErrorKind::GraphError => "GraphError",
            ErrorKind::OptimizerError => "OptimizerError",
            ErrorKind::DeviceNotSupported => "DeviceNotSupported",
            ErrorKind::UnknownDevice => "UnknownDevice",
            ErrorKind::DuplicateRegistration => "DuplicateRegistration",
            ErrorKind::InvalidState => "InvalidState",
            ErrorKind::ParamError => "ParamError",
            ErrorKind::KernelError => "KernelError",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error value carrying a kind and a human-readable message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{kind}: {message}")]
pub struct Status {
    kind: ErrorKind,
    message: String,
}

pub type Result<T, E = Status> = std::result::Result<T, E>;

impl Status {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Status {
            kind,
            message: message.into(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn device_error(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::DeviceError, message)
    }

    pub fn out_of_memory(bytes: usize, device: DeviceType) -> Self {
        Status::new(
            ErrorKind::OutOfMemory,
            format!("failed to allocate {bytes} bytes on {device}"),
        )
    }

    pub fn unsupported_operator(layer: LayerType, device: DeviceType) -> Self {
        Status::new(
            ErrorKind::UnsupportedOperator,
            format!("no kernel registered for operator {layer} on device {device}"),
        )
    }

    pub fn unsupported_format(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::UnsupportedFormat, message)
    }

    pub fn shape_inference(layer: &str, message: impl fmt::Display) -> Self {
        Status::new(
            ErrorKind::ShapeInferenceError,
            format!("layer '{layer}': {message}"),
        )
    }

    pub fn shape(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::ShapeError, message)
    }

    pub fn graph(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::GraphError, message)
    }

    pub fn optimizer(pass: &str, message: impl fmt::Display) -> Self {
        Status::new(ErrorKind::OptimizerError, format!("{pass}: {message}"))
    }

    pub fn device_not_supported(device: DeviceType, what: &str) -> Self {
        Status::new(
            ErrorKind::DeviceNotSupported,
            format!("{what} is not supported on device {device}"),
        )
    }

    pub fn invalid_state(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::InvalidState, message)
    }

    pub fn param(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::ParamError, message)
    }

    pub fn kernel(message: impl Into<String>) -> Self {
        Status::new(ErrorKind::KernelError, message)
    }
}
