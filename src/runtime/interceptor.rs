//! Call Interceptor
//!
//! Rewritten code hands every call to the interceptor installed in an
//! [`InterceptorRegistry`] at the moment the call executes. The interceptor
//! receives the call's target, its arguments and the identity of the method
//! that would have been called, and its result replaces the call's result.
//!
//! Because the registry is read on every call, a different strategy can be
//! installed at any time without rewriting the module again.
//!
//! # Recording
//!
//! [`RecordingInterceptor`] keeps every dispatch and answers with canned
//! responses, which makes it the natural strategy for tests and replay.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Mutex, RwLock};

use thiserror::Error;

use crate::il::{MethodSig, MethodToken, Module, TypeToken};

use super::logger::Logger;
use super::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum InterceptError {
    #[error("interceptor rejected {method}: {reason}")]
    Rejected { method: String, reason: String },

    #[error("interceptor failed: {0}")]
    Failed(String),
}

/// Identity of an intercepted method, recovered from the tokens captured at
/// rewrite time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MethodIdentity {
    pub token: MethodToken,
    pub declaring_type: TypeToken,
    pub type_name: String,
    pub method_name: String,
    pub signature: MethodSig,
}

impl MethodIdentity {
    /// `Type::Method`
    pub fn qualified_name(&self) -> String {
        format!("{}::{}", self.type_name, self.method_name)
    }
}

impl fmt::Display for MethodIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let params: Vec<String> = self.signature.params.iter().map(|p| p.to_string()).collect();
        write!(
            f,
            "{} {}::{}({})",
            self.signature.ret,
            self.type_name,
            self.method_name,
            params.join(", ")
        )
    }
}

/// Token-keyed lookup of method identities, built once per module.
#[derive(Debug, Default)]
pub struct IdentityTable {
    entries: HashMap<(TypeToken, MethodToken), Arc<MethodIdentity>>,
}

impl IdentityTable {
    pub fn build(module: &Module) -> Self {
        let mut entries = HashMap::with_capacity(module.methods.len());
        for (idx, method) in module.methods.iter().enumerate() {
            let Some(ty) = module.type_def(method.declaring_type) else {
                continue;
            };
            let token = MethodToken(idx as u32);
            entries.insert(
                (method.declaring_type, token),
                Arc::new(MethodIdentity {
                    token,
                    declaring_type: method.declaring_type,
                    type_name: ty.name.clone(),
                    method_name: method.name.clone(),
                    signature: method.signature.clone(),
                }),
            );
        }
        Self { entries }
    }

    pub fn resolve(&self, ty: TypeToken, method: MethodToken) -> Option<Arc<MethodIdentity>> {
        self.entries.get(&(ty, method)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Strategy invoked in place of every rewritten call.
///
/// `target` is [`Value::Null`] for static methods. Value-type arguments
/// arrive boxed. For methods that return a value, the result must be
/// coercible to the declared return type (boxed for value types), otherwise
/// the rewritten code fails at the coercion.
pub trait Interceptor: Send + Sync {
    fn intercept(
        &self,
        target: Value,
        args: &[Value],
        method: &MethodIdentity,
    ) -> Result<Value, InterceptError>;
}

/// Holder of the currently installed interceptor.
pub struct InterceptorRegistry {
    current: RwLock<Arc<dyn Interceptor>>,
}

impl InterceptorRegistry {
    pub fn new(interceptor: Arc<dyn Interceptor>) -> Self {
        Self {
            current: RwLock::new(interceptor),
        }
    }

    /// The interceptor rewritten code will dispatch to.
    pub fn current(&self) -> Arc<dyn Interceptor> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Replace the interceptor; returns the previous one.
    pub fn install(&self, interceptor: Arc<dyn Interceptor>) -> Arc<dyn Interceptor> {
        let mut current = self.current.write().unwrap_or_else(|e| e.into_inner());
        std::mem::replace(&mut *current, interceptor)
    }
}

impl Default for InterceptorRegistry {
    fn default() -> Self {
        Self::new(Arc::new(LoggingInterceptor::new(Arc::new(
            super::logger::LogLogger,
        ))))
    }
}

/// Writes each dispatch to a logger, then answers with a fixed value.
pub struct LoggingInterceptor {
    logger: Arc<dyn Logger>,
    response: Value,
}

impl LoggingInterceptor {
    pub fn new(logger: Arc<dyn Logger>) -> Self {
        Self {
            logger,
            response: Value::Null,
        }
    }

    /// Answer every call with `response` instead of null.
    pub fn returning(mut self, response: Value) -> Self {
        self.response = response;
        self
    }
}

impl Interceptor for LoggingInterceptor {
    fn intercept(
        &self,
        target: Value,
        args: &[Value],
        method: &MethodIdentity,
    ) -> Result<Value, InterceptError> {
        self.logger.write_line_with("method: {0}", &method.to_string());
        self.logger.write_line_with("target: {0}", &target.to_string());
        let rendered: Vec<String> = args
            .iter()
            .enumerate()
            .map(|(i, v)| format!("arg{}: <{}>", i, v))
            .collect();
        self.logger.write_line(&rendered.join(", "));
        Ok(self.response.clone())
    }
}

/// One observed dispatch.
#[derive(Debug, Clone, PartialEq)]
pub struct InterceptedCall {
    pub target: Value,
    pub args: Vec<Value>,
    pub method: MethodIdentity,
}

/// Records every dispatch and answers from a table of responses.
pub struct RecordingInterceptor {
    calls: Mutex<Vec<InterceptedCall>>,
    responses: HashMap<String, Value>,
    default_response: Value,
}

impl RecordingInterceptor {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            responses: HashMap::new(),
            default_response: Value::Null,
        }
    }

    /// Answer calls to `type_name::method_name` with `value`.
    pub fn respond(mut self, type_name: &str, method_name: &str, value: Value) -> Self {
        self.responses
            .insert(format!("{}::{}", type_name, method_name), value);
        self
    }

    /// Answer calls without a specific response with `value`.
    pub fn respond_by_default(mut self, value: Value) -> Self {
        self.default_response = value;
        self
    }

    pub fn calls(&self) -> Vec<InterceptedCall> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn clear(&self) {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clear();
    }
}

impl Default for RecordingInterceptor {
    fn default() -> Self {
        Self::new()
    }
}

impl Interceptor for RecordingInterceptor {
    fn intercept(
        &self,
        target: Value,
        args: &[Value],
        method: &MethodIdentity,
    ) -> Result<Value, InterceptError> {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(InterceptedCall {
                target,
                args: args.to_vec(),
                method: method.clone(),
            });
        Ok(self
            .responses
            .get(&method.qualified_name())
            .unwrap_or(&self.default_response)
            .clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{ModuleBuilder, ReturnSig, TypeSig};
    use crate::runtime::MemoryLogger;

    fn identity() -> MethodIdentity {
        MethodIdentity {
            token: MethodToken(0),
            declaring_type: TypeToken(0),
            type_name: "Console".to_string(),
            method_name: "WriteLine".to_string(),
            signature: MethodSig::new_static(vec![TypeSig::String], ReturnSig::Void),
        }
    }

    #[test]
    fn test_identity_table() {
        let mut builder = ModuleBuilder::new("m");
        let console = builder.add_type("Console");
        let write_line = builder.add_native(
            console,
            "WriteLine",
            MethodSig::new_static(vec![TypeSig::String], ReturnSig::Void),
        );
        let table = IdentityTable::build(&builder.finish());

        let id = table.resolve(console, write_line).unwrap();
        assert_eq!(id.qualified_name(), "Console::WriteLine");
        assert_eq!(id.to_string(), "void Console::WriteLine(string)");
        assert!(table.resolve(TypeToken(1), write_line).is_none());
    }

    #[test]
    fn test_logging_interceptor() {
        let logger = Arc::new(MemoryLogger::new());
        let interceptor =
            LoggingInterceptor::new(logger.clone()).returning(Value::boxed(Value::I32(1)));

        let args = [Value::str("hi"), Value::boxed(Value::I32(3))];
        let result = interceptor
            .intercept(Value::Null, &args, &identity())
            .unwrap();

        assert_eq!(result, Value::boxed(Value::I32(1)));
        assert_eq!(
            logger.lines(),
            vec![
                "method: void Console::WriteLine(string)".to_string(),
                "target: null".to_string(),
                "arg0: <hi>, arg1: <3>".to_string(),
            ]
        );
    }

    #[test]
    fn test_recording_interceptor_responses() {
        let interceptor = RecordingInterceptor::new()
            .respond("Console", "WriteLine", Value::I32(9))
            .respond_by_default(Value::str("default"));

        let mut other = identity();
        other.method_name = "Beep".to_string();

        assert_eq!(
            interceptor.intercept(Value::Null, &[], &identity()).unwrap(),
            Value::I32(9)
        );
        assert_eq!(
            interceptor.intercept(Value::Null, &[], &other).unwrap(),
            Value::str("default")
        );
        assert_eq!(interceptor.calls().len(), 2);
        interceptor.clear();
        assert!(interceptor.calls().is_empty());
    }

    #[test]
    fn test_registry_swap() {
        let first: Arc<dyn Interceptor> = Arc::new(RecordingInterceptor::new());
        let second: Arc<dyn Interceptor> = Arc::new(RecordingInterceptor::new());
        let registry = InterceptorRegistry::new(first.clone());

        let previous = registry.install(second.clone());
        assert!(std::ptr::addr_eq(Arc::as_ptr(&previous), Arc::as_ptr(&first)));
        assert!(std::ptr::addr_eq(
            Arc::as_ptr(&registry.current()),
            Arc::as_ptr(&second)
        ));
    }
}
