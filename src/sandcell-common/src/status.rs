use std::fmt;

/// Numeric status taxonomy for every failure the runtime can report.
///
/// The discriminants are part of the wire protocol: a worker reply carries
/// the kind as an `i32`, so variants must never be renumbered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum StatusKind {
    /// The operation completed.
    Ok = 0,
    /// Missing or mismatched tags, empty handler on execute, bad request shape.
    InvalidArgument = 1,
    /// The script failed to compile.
    CompileError = 2,
    /// Top-level script execution threw.
    RunError = 3,
    /// The handler was missing, not a function, or threw when called.
    InvokeError = 4,
    /// A handler returned a promise that rejected.
    AsyncExecutionFailed = 5,
    /// A request input failed to parse, or wasm argument marshalling failed.
    InputParseError = 6,
    /// The handler return value could not be serialized to JSON.
    OutputStringifyError = 7,
    /// Execute referenced a code version with no cached compilation context.
    MissingContext = 8,
    /// The request type tag named an unsupported engine request type.
    UnknownRequestType = 9,
    /// A wasm code object declared no usable return type.
    UnknownWasmReturnType = 10,
    /// The code object carried neither a script nor a wasm module.
    UnknownCodeType = 11,
    /// The watchdog terminated the execution.
    ExecutionTimeout = 12,
    /// The sandboxed child process could not be created or initialized.
    SandboxInitFailed = 13,
    /// Transport to or from the sandboxed child failed.
    SandboxIpcFailed = 14,
    /// An operation was attempted on a sandbox that was never initialized.
    SandboxNotInitialized = 15,
    /// The sandboxed child died; it has been restarted and the request may
    /// be retried by the caller.
    WorkerCrashed = 16,
    /// A broadcast is in flight and new dispatches are not admitted.
    DispatchDisallowed = 17,
    /// The in-flight request count reached the configured cap.
    CapacityExhausted = 18,
    /// An internal invariant failed.
    Internal = 19,
}

impl StatusKind {
    /// Recover a kind from its wire representation. Unknown values map to
    /// [`StatusKind::Internal`] so a version-skewed peer cannot make the
    /// host panic.
    pub fn from_i32(value: i32) -> StatusKind {
        match value {
            0 => StatusKind::Ok,
            1 => StatusKind::InvalidArgument,
            2 => StatusKind::CompileError,
            3 => StatusKind::RunError,
            4 => StatusKind::InvokeError,
            5 => StatusKind::AsyncExecutionFailed,
            6 => StatusKind::InputParseError,
            7 => StatusKind::OutputStringifyError,
            8 => StatusKind::MissingContext,
            9 => StatusKind::UnknownRequestType,
            10 => StatusKind::UnknownWasmReturnType,
            11 => StatusKind::UnknownCodeType,
            12 => StatusKind::ExecutionTimeout,
            13 => StatusKind::SandboxInitFailed,
            14 => StatusKind::SandboxIpcFailed,
            15 => StatusKind::SandboxNotInitialized,
            16 => StatusKind::WorkerCrashed,
            17 => StatusKind::DispatchDisallowed,
            18 => StatusKind::CapacityExhausted,
            _ => StatusKind::Internal,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            StatusKind::Ok => "ok",
            StatusKind::InvalidArgument => "invalid argument",
            StatusKind::CompileError => "compile error",
            StatusKind::RunError => "run error",
            StatusKind::InvokeError => "invoke error",
            StatusKind::AsyncExecutionFailed => "async execution failed",
            StatusKind::InputParseError => "input parse error",
            StatusKind::OutputStringifyError => "output stringify error",
            StatusKind::MissingContext => "missing compilation context",
            StatusKind::UnknownRequestType => "unknown request type",
            StatusKind::UnknownWasmReturnType => "unknown wasm return type",
            StatusKind::UnknownCodeType => "unknown code type",
            StatusKind::ExecutionTimeout => "execution timeout",
            StatusKind::SandboxInitFailed => "sandbox init failed",
            StatusKind::SandboxIpcFailed => "sandbox ipc failed",
            StatusKind::SandboxNotInitialized => "sandbox not initialized",
            StatusKind::WorkerCrashed => "worker crashed",
            StatusKind::DispatchDisallowed => "dispatch disallowed",
            StatusKind::CapacityExhausted => "capacity exhausted",
            StatusKind::Internal => "internal error",
        }
    }
}

impl fmt::Display for StatusKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type for every fallible sandcell operation.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct Error {
    /// Which failure class this is.
    pub kind: StatusKind,
    /// Human-readable detail, e.g. the extracted engine message.
    pub message: String,
}

impl Error {
    /// Create an error of the given kind.
    pub fn new(kind: StatusKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    /// Shorthand for an [`StatusKind::InvalidArgument`] error.
    pub fn invalid_argument(message: impl Into<String>) -> Self {
        Self::new(StatusKind::InvalidArgument, message)
    }

    /// Whether the failure has a retry disposition: the sandbox has already
    /// been replaced and the same request may succeed if submitted again.
    pub fn is_retryable(&self) -> bool {
        self.kind == StatusKind::WorkerCrashed
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        Error::new(StatusKind::SandboxIpcFailed, err.to_string())
    }
}

impl From<prost::DecodeError> for Error {
    fn from(err: prost::DecodeError) -> Self {
        Error::new(StatusKind::SandboxIpcFailed, err.to_string())
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_round_trips_through_wire_representation() {
        for kind in [
            StatusKind::Ok,
            StatusKind::MissingContext,
            StatusKind::ExecutionTimeout,
            StatusKind::CapacityExhausted,
            StatusKind::Internal,
        ] {
            assert_eq!(StatusKind::from_i32(kind as i32), kind);
        }
    }

    #[test]
    fn unknown_wire_value_maps_to_internal() {
        assert_eq!(StatusKind::from_i32(9999), StatusKind::Internal);
        assert_eq!(StatusKind::from_i32(-1), StatusKind::Internal);
    }

    #[test]
    fn only_worker_crashes_are_retryable() {
        assert!(Error::new(StatusKind::WorkerCrashed, "gone").is_retryable());
        assert!(!Error::new(StatusKind::CompileError, "bad js").is_retryable());
    }
}
