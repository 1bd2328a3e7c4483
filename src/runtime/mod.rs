//! Execution Runtime
//!
//! Runs method bodies, original or rewritten, and hosts the dispatch contract
//! that rewritten code relies on.

mod interceptor;
mod logger;
mod machine;
mod value;

pub use interceptor::{
    IdentityTable, InterceptError, InterceptedCall, Interceptor, InterceptorRegistry,
    LoggingInterceptor, MethodIdentity, RecordingInterceptor,
};
pub use logger::{LogLogger, Logger, LoggerRegistry, MemoryLogger};
pub use machine::{ExecutionLimits, Machine, NativeFn};
pub use value::{ArrayRef, ObjectRef, Value};

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RuntimeError {
    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("No native implementation registered for {0}")]
    MissingNative(String),

    #[error("Arity mismatch calling {method}: expected {expected} values, got {got}")]
    ArityMismatch {
        method: String,
        expected: usize,
        got: usize,
    },

    #[error("Stack underflow in {method} at instruction {position}")]
    StackUnderflow { method: String, position: usize },

    #[error("Type mismatch: {0}")]
    TypeMismatch(String),

    #[error("Invalid cast: cannot coerce {value} to {target}")]
    InvalidCast { value: String, target: String },

    #[error("Index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("Invalid index: {0}")]
    InvalidIndex(String),

    #[error("Branch to undefined label L{label} in {method}")]
    UnknownLabel { method: String, label: u32 },

    #[error("Unknown method identity: {0}")]
    UnknownIdentity(String),

    #[error(transparent)]
    Intercept(#[from] InterceptError),

    #[error("Native method {method} failed: {message}")]
    Native { method: String, message: String },

    #[error("{0} ended without returning a value")]
    MissingReturn(String),

    #[error("Call depth limit of {0} exceeded")]
    CallDepthExceeded(usize),

    #[error("Step limit of {0} exceeded")]
    StepLimitExceeded(u64),
}

/// Strategies visible to executing code.
///
/// Rewritten code reads the interceptor from `interceptors` on every call;
/// native methods get the logger from `loggers`.
#[derive(Clone, Default)]
pub struct ExecutionContext {
    pub interceptors: Arc<InterceptorRegistry>,
    pub loggers: Arc<LoggerRegistry>,
}

impl ExecutionContext {
    pub fn new(interceptors: Arc<InterceptorRegistry>, loggers: Arc<LoggerRegistry>) -> Self {
        Self {
            interceptors,
            loggers,
        }
    }

    /// Context with `interceptor` installed and the default logger.
    pub fn with_interceptor(interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            interceptors: Arc::new(InterceptorRegistry::new(interceptor)),
            loggers: Arc::new(LoggerRegistry::default()),
        }
    }

    pub fn logger(&self) -> Arc<dyn Logger> {
        self.loggers.current()
    }
}
