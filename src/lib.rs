//! Callweave: call-site interception for stack-machine bytecode
//!
//! Rewrites method bodies so that every call they make is redirected through
//! a pluggable interceptor. The interceptor sees the call's target, its
//! arguments and the identity of the callee, and its return value (coerced to
//! the callee's declared return type) replaces the original result.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────┐
//! │               Callweave                 │
//! │                                         │
//! │  il       - Module model, binary codec  │
//! │  rewrite  - Call-site rewriting pass    │
//! │  runtime  - Interpreter, interceptors   │
//! │                                         │
//! ├─────────────────────────────────────────┤
//! │        Host: loading, storage, I/O      │
//! └─────────────────────────────────────────┘
//! ```
//!
//! ## Rewritten call sites
//!
//! ```text
//! ldarg.0                     ldarg.0
//! ldstr "hi"                  ldstr "hi"
//! call Widget::Show(string)   stloc p0 ; stloc recv ; get.interceptor
//!                             ... build object[] { p0 } ...
//!                             ldloc recv ; ldloc args ; ldtoken ... ; resolve.method
//!                             intercept ; pop
//! ```

pub mod il;
pub mod rewrite;
pub mod runtime;
pub mod sample;

pub use il::{decode, encode, Module};
pub use rewrite::{CallSiteRewriter, RewriteError, RewriteOutcome};
pub use runtime::{ExecutionContext, Interceptor, Machine, Value};
