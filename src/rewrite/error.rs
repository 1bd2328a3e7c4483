//! Error types for call-site rewriting.

use thiserror::Error;

/// Errors that abort the rewrite of a method body.
///
/// A failed rewrite never commits anything: the body keeps its original
/// instructions and locals.
#[derive(Debug, Error)]
pub enum RewriteError {
    /// The callee of a call instruction could not be described statically.
    #[error("cannot resolve call signature at instruction {position} in '{method}': {reason}")]
    SignatureResolution {
        method: String,
        position: usize,
        reason: String,
    },

    /// The body would need more local slots than the host allows.
    #[error("local slot limit of {limit} exceeded in '{method}'")]
    ResourceExhausted { method: String, limit: u32 },

    /// A method token handed to the rewriter does not exist in the module.
    #[error("method not found: {0}")]
    MethodNotFound(String),

    /// The method exists but has no body (host-native).
    #[error("method '{0}' has no body to rewrite")]
    NoBody(String),
}
