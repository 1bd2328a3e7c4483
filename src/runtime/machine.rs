//! Stack-machine interpreter for method bodies.
//!
//! Runs original and rewritten code alike. Calls to methods without a body go
//! to natives registered by name; `intercept` goes to whatever interceptor the
//! context's registry holds when it executes.

use std::collections::HashMap;
use std::sync::Arc;

use crate::il::{
    CallTarget, Instruction, LabelId, MetadataToken, MethodBody, MethodDef, MethodToken, Module,
    Op, ReturnSig, TypeSig,
};

use super::interceptor::IdentityTable;
use super::value::{ArrayRef, ObjectRef, Value};
use super::{ExecutionContext, RuntimeError};

/// Host implementation of a method without a body. Receives the receiver
/// first for instance methods.
pub type NativeFn =
    Arc<dyn Fn(&ExecutionContext, &[Value]) -> Result<Option<Value>, RuntimeError> + Send + Sync>;

#[derive(Debug, Clone, Copy)]
pub struct ExecutionLimits {
    pub max_call_depth: usize,
    pub max_steps: u64,
}

impl Default for ExecutionLimits {
    fn default() -> Self {
        Self {
            max_call_depth: 256,
            max_steps: 10_000_000,
        }
    }
}

/// Executes the methods of one module.
pub struct Machine<'m> {
    module: &'m Module,
    context: ExecutionContext,
    identities: IdentityTable,
    natives: HashMap<MethodToken, NativeFn>,
    limits: ExecutionLimits,
    steps: u64,
}

impl<'m> Machine<'m> {
    pub fn new(module: &'m Module, context: ExecutionContext) -> Self {
        Self {
            module,
            context,
            identities: IdentityTable::build(module),
            natives: HashMap::new(),
            limits: ExecutionLimits::default(),
            steps: 0,
        }
    }

    pub fn with_limits(mut self, limits: ExecutionLimits) -> Self {
        self.limits = limits;
        self
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.context
    }

    /// Provide the implementation of `type_name::method_name`.
    pub fn register_native<F>(
        &mut self,
        type_name: &str,
        method_name: &str,
        f: F,
    ) -> Result<MethodToken, RuntimeError>
    where
        F: Fn(&ExecutionContext, &[Value]) -> Result<Option<Value>, RuntimeError>
            + Send
            + Sync
            + 'static,
    {
        let token = self.lookup(type_name, method_name)?;
        self.natives.insert(token, Arc::new(f));
        Ok(token)
    }

    pub fn lookup(&self, type_name: &str, method_name: &str) -> Result<MethodToken, RuntimeError> {
        self.module
            .find_type(type_name)
            .and_then(|ty| self.module.find_method(ty, method_name))
            .ok_or_else(|| {
                RuntimeError::MethodNotFound(format!("{}::{}", type_name, method_name))
            })
    }

    /// Call a method. `args` starts with the receiver for instance methods.
    /// Returns `None` for void methods.
    pub fn invoke(
        &mut self,
        method: MethodToken,
        args: Vec<Value>,
    ) -> Result<Option<Value>, RuntimeError> {
        self.steps = 0;
        self.call(method, args, 0)
    }

    pub fn invoke_named(
        &mut self,
        type_name: &str,
        method_name: &str,
        args: Vec<Value>,
    ) -> Result<Option<Value>, RuntimeError> {
        let method = self.lookup(type_name, method_name)?;
        self.invoke(method, args)
    }

    fn call(
        &mut self,
        method: MethodToken,
        args: Vec<Value>,
        depth: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        if depth >= self.limits.max_call_depth {
            return Err(RuntimeError::CallDepthExceeded(self.limits.max_call_depth));
        }

        let module = self.module;
        let def = module
            .method(method)
            .ok_or_else(|| RuntimeError::MethodNotFound(method.to_string()))?;
        let name = module.qualified_name(method);

        let sig = &def.signature;
        if args.len() != sig.stack_arity() {
            return Err(RuntimeError::ArityMismatch {
                method: name,
                expected: sig.stack_arity(),
                got: args.len(),
            });
        }
        let offset = usize::from(!sig.is_static);
        for (param, arg) in sig.params.iter().zip(&args[offset..]) {
            if !arg.fits(param) {
                return Err(RuntimeError::TypeMismatch(format!(
                    "argument {} to {}: expected {}, got {}",
                    arg,
                    name,
                    param,
                    arg.type_name()
                )));
            }
        }

        match &def.body {
            Some(body) => self.execute(def, &name, body, args, depth),
            None => {
                let native = self
                    .natives
                    .get(&method)
                    .cloned()
                    .ok_or(RuntimeError::MissingNative(name))?;
                (*native)(&self.context, &args)
            }
        }
    }

    fn execute(
        &mut self,
        def: &MethodDef,
        name: &str,
        body: &MethodBody,
        mut args: Vec<Value>,
        depth: usize,
    ) -> Result<Option<Value>, RuntimeError> {
        let labels = index_labels(name, body)?;
        let mut locals: Vec<Value> = body
            .locals
            .iter()
            .map(|l| Value::default_for(&l.ty))
            .collect();
        let mut frame = Frame {
            method: name,
            stack: Vec::new(),
            pc: 0,
        };

        while let Some(instruction) = body.instructions.get(frame.pc) {
            self.steps += 1;
            if self.steps > self.limits.max_steps {
                return Err(RuntimeError::StepLimitExceeded(self.limits.max_steps));
            }
            frame.pc += 1;

            let op = match instruction {
                Instruction::Call(target) => {
                    self.execute_call(*target, &mut frame, depth)?;
                    continue;
                }
                Instruction::Other(op) => op,
            };

            match op {
                Op::Nop | Op::Label(_) => {}
                Op::LdArg(idx) => {
                    let value = args
                        .get(*idx as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::InvalidIndex(format!("argument {}", idx)))?;
                    frame.push(value);
                }
                Op::StArg(idx) => {
                    let value = frame.pop()?;
                    let slot = args
                        .get_mut(*idx as usize)
                        .ok_or_else(|| RuntimeError::InvalidIndex(format!("argument {}", idx)))?;
                    *slot = value;
                }
                Op::LdLoc(idx) => {
                    let value = locals
                        .get(idx.0 as usize)
                        .cloned()
                        .ok_or_else(|| RuntimeError::InvalidIndex(format!("local {}", idx.0)))?;
                    frame.push(value);
                }
                Op::StLoc(idx) => {
                    let value = frame.pop()?;
                    let decl = body
                        .locals
                        .get(idx.0 as usize)
                        .ok_or_else(|| RuntimeError::InvalidIndex(format!("local {}", idx.0)))?;
                    if !value.fits(&decl.ty) {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "cannot store {} in local {} of type {}",
                            value.type_name(),
                            idx.0,
                            decl.ty
                        )));
                    }
                    locals[idx.0 as usize] = value;
                }
                Op::LdNull => frame.push(Value::Null),
                Op::LdcI4(v) => frame.push(Value::I32(*v)),
                Op::LdcI8(v) => frame.push(Value::I64(*v)),
                Op::LdcR8(v) => frame.push(Value::F64(*v)),
                Op::LdStr(s) => frame.push(Value::str(s)),
                Op::Dup => {
                    let top = frame.peek()?.clone();
                    frame.push(top);
                }
                Op::Pop => {
                    frame.pop()?;
                }
                Op::Add | Op::Sub | Op::Mul | Op::Clt => {
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    frame.push(arithmetic(op, lhs, rhs)?);
                }
                Op::Ceq => {
                    let rhs = frame.pop()?;
                    let lhs = frame.pop()?;
                    frame.push(Value::I32(i32::from(lhs == rhs)));
                }
                Op::Br(label) => frame.pc = labels[label],
                Op::BrTrue(label) | Op::BrFalse(label) => {
                    let truthy = is_true(&frame.pop()?)?;
                    if truthy == matches!(op, Op::BrTrue(_)) {
                        frame.pc = labels[label];
                    }
                }
                Op::Ret => return frame.finish(&def.signature.ret),
                Op::Box(ty) => {
                    let value = frame.pop()?;
                    if !value.fits(ty) {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "cannot box {} as {}",
                            value.type_name(),
                            ty
                        )));
                    }
                    if ty.is_value_type() {
                        frame.push(Value::boxed(value));
                    } else {
                        frame.push(value);
                    }
                }
                Op::UnboxAny(ty) => {
                    let value = frame.pop()?;
                    frame.push(coerce(value, ty)?);
                }
                Op::NewObj(ty) => frame.push(Value::Object(ObjectRef::new(*ty))),
                Op::NewArr(ty) => {
                    let len = frame.pop()?;
                    let len = match len {
                        Value::I32(n) if n >= 0 => n as usize,
                        other => {
                            return Err(RuntimeError::TypeMismatch(format!(
                                "invalid array length {}",
                                other
                            )))
                        }
                    };
                    frame.push(Value::Array(ArrayRef::new(
                        ty.clone(),
                        vec![Value::default_for(ty); len],
                    )));
                }
                Op::StElemRef => {
                    let value = frame.pop()?;
                    let index = frame.pop()?;
                    let array = frame.pop_array()?;
                    let index = array_index(&index)?;
                    if !value.is_reference() || !value.fits(array.elem_type()) {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "cannot store {} in {} array",
                            value.type_name(),
                            array.elem_type()
                        )));
                    }
                    if !array.set(index, value) {
                        return Err(RuntimeError::IndexOutOfRange {
                            index,
                            len: array.len(),
                        });
                    }
                }
                Op::LdElemRef => {
                    let index = frame.pop()?;
                    let array = frame.pop_array()?;
                    let index = array_index(&index)?;
                    let value = array.get(index).ok_or(RuntimeError::IndexOutOfRange {
                        index,
                        len: array.len(),
                    })?;
                    frame.push(value);
                }
                Op::LdLen => {
                    let array = frame.pop_array()?;
                    frame.push(Value::I32(array.len() as i32));
                }
                Op::LdToken(token) => frame.push(Value::Token(*token)),
                Op::LdFtn(method) => frame.push(Value::Function(*method)),
                Op::ResolveMethod => {
                    let method = frame.pop()?;
                    let ty = frame.pop()?;
                    let (
                        Value::Token(MetadataToken::Type(ty)),
                        Value::Token(MetadataToken::Method(method)),
                    ) = (&ty, &method)
                    else {
                        return Err(RuntimeError::TypeMismatch(format!(
                            "resolve.method expects a type and a method token, got {} and {}",
                            ty.type_name(),
                            method.type_name()
                        )));
                    };
                    let identity = self.identities.resolve(*ty, *method).ok_or_else(|| {
                        RuntimeError::UnknownIdentity(format!("{} / {}", ty, method))
                    })?;
                    frame.push(Value::Method(identity));
                }
                Op::GetInterceptor => {
                    frame.push(Value::Interceptor(self.context.interceptors.current()));
                }
                Op::Intercept => {
                    let identity = frame.pop()?;
                    let args_array = frame.pop_array()?;
                    let receiver = frame.pop()?;
                    let interceptor = frame.pop()?;
                    let (Value::Interceptor(interceptor), Value::Method(identity)) =
                        (interceptor, identity)
                    else {
                        return Err(RuntimeError::TypeMismatch(
                            "intercept expects an interceptor and a method identity".to_string(),
                        ));
                    };
                    let result =
                        interceptor.intercept(receiver, &args_array.to_vec(), &identity)?;
                    frame.push(result);
                }
            }
        }

        match def.signature.ret {
            ReturnSig::Void => Ok(None),
            ReturnSig::Type(_) => Err(RuntimeError::MissingReturn(name.to_string())),
        }
    }

    fn execute_call(
        &mut self,
        target: CallTarget,
        frame: &mut Frame<'_>,
        depth: usize,
    ) -> Result<(), RuntimeError> {
        let method = match target {
            CallTarget::Direct(method) => method,
            CallTarget::Indirect { arity } => {
                let Value::Function(method) = frame.pop()? else {
                    return Err(RuntimeError::TypeMismatch(
                        "indirect call expects a function value".to_string(),
                    ));
                };
                let expected = self
                    .module
                    .method(method)
                    .map(|m| m.signature.stack_arity())
                    .ok_or_else(|| RuntimeError::MethodNotFound(method.to_string()))?;
                if expected != arity as usize {
                    return Err(RuntimeError::ArityMismatch {
                        method: self.module.qualified_name(method),
                        expected,
                        got: arity as usize,
                    });
                }
                method
            }
        };

        let arity = self
            .module
            .method(method)
            .map(|m| m.signature.stack_arity())
            .ok_or_else(|| RuntimeError::MethodNotFound(method.to_string()))?;
        let args = frame.pop_n(arity)?;
        if let Some(result) = self.call(method, args, depth + 1)? {
            frame.push(result);
        }
        Ok(())
    }
}

struct Frame<'a> {
    method: &'a str,
    stack: Vec<Value>,
    pc: usize,
}

impl Frame<'_> {
    fn push(&mut self, value: Value) {
        self.stack.push(value);
    }

    fn pop(&mut self) -> Result<Value, RuntimeError> {
        self.stack.pop().ok_or_else(|| RuntimeError::StackUnderflow {
            method: self.method.to_string(),
            position: self.pc.saturating_sub(1),
        })
    }

    fn peek(&self) -> Result<&Value, RuntimeError> {
        self.stack.last().ok_or_else(|| RuntimeError::StackUnderflow {
            method: self.method.to_string(),
            position: self.pc.saturating_sub(1),
        })
    }

    /// Pop `n` values, returned in push order.
    fn pop_n(&mut self, n: usize) -> Result<Vec<Value>, RuntimeError> {
        if self.stack.len() < n {
            return Err(RuntimeError::StackUnderflow {
                method: self.method.to_string(),
                position: self.pc.saturating_sub(1),
            });
        }
        Ok(self.stack.split_off(self.stack.len() - n))
    }

    fn pop_array(&mut self) -> Result<ArrayRef, RuntimeError> {
        match self.pop()? {
            Value::Array(array) => Ok(array),
            other => Err(RuntimeError::TypeMismatch(format!(
                "expected an array, got {}",
                other.type_name()
            ))),
        }
    }

    fn finish(mut self, ret: &ReturnSig) -> Result<Option<Value>, RuntimeError> {
        match ret {
            ReturnSig::Void => Ok(None),
            ReturnSig::Type(ty) => {
                let value = self.pop()?;
                if !value.fits(ty) {
                    return Err(RuntimeError::TypeMismatch(format!(
                        "{} returns {}, got {}",
                        self.method,
                        ty,
                        value.type_name()
                    )));
                }
                Ok(Some(value))
            }
        }
    }
}

fn index_labels(method: &str, body: &MethodBody) -> Result<HashMap<LabelId, usize>, RuntimeError> {
    let mut labels = HashMap::new();
    for (pos, inst) in body.instructions.iter().enumerate() {
        if let Instruction::Other(Op::Label(label)) = inst {
            labels.insert(*label, pos);
        }
    }
    for inst in &body.instructions {
        if let Instruction::Other(Op::Br(label) | Op::BrTrue(label) | Op::BrFalse(label)) = inst {
            if !labels.contains_key(label) {
                return Err(RuntimeError::UnknownLabel {
                    method: method.to_string(),
                    label: label.0,
                });
            }
        }
    }
    Ok(labels)
}

/// Convert a reference-form value back to `ty`: unbox for value types,
/// checked cast for reference types.
fn coerce(value: Value, ty: &TypeSig) -> Result<Value, RuntimeError> {
    if ty.is_value_type() {
        if let Value::Boxed(inner) = &value {
            if inner.fits(ty) {
                return Ok(inner.as_ref().clone());
            }
        }
    } else if value.fits(ty) {
        return Ok(value);
    }
    Err(RuntimeError::InvalidCast {
        value: format!("{:?}", value),
        target: ty.to_string(),
    })
}

fn arithmetic(op: &Op, lhs: Value, rhs: Value) -> Result<Value, RuntimeError> {
    let result = match (&lhs, &rhs) {
        (Value::I32(a), Value::I32(b)) => match op {
            Op::Add => Value::I32(a.wrapping_add(*b)),
            Op::Sub => Value::I32(a.wrapping_sub(*b)),
            Op::Mul => Value::I32(a.wrapping_mul(*b)),
            _ => Value::I32(i32::from(a < b)),
        },
        (Value::I64(a), Value::I64(b)) => match op {
            Op::Add => Value::I64(a.wrapping_add(*b)),
            Op::Sub => Value::I64(a.wrapping_sub(*b)),
            Op::Mul => Value::I64(a.wrapping_mul(*b)),
            _ => Value::I32(i32::from(a < b)),
        },
        (Value::F64(a), Value::F64(b)) => match op {
            Op::Add => Value::F64(a + b),
            Op::Sub => Value::F64(a - b),
            Op::Mul => Value::F64(a * b),
            _ => Value::I32(i32::from(a < b)),
        },
        _ => {
            return Err(RuntimeError::TypeMismatch(format!(
                "{} on {} and {}",
                op,
                lhs.type_name(),
                rhs.type_name()
            )))
        }
    };
    Ok(result)
}

fn is_true(value: &Value) -> Result<bool, RuntimeError> {
    match value {
        Value::Bool(b) => Ok(*b),
        Value::I32(v) => Ok(*v != 0),
        Value::I64(v) => Ok(*v != 0),
        Value::Null => Ok(false),
        v if v.is_reference() => Ok(true),
        other => Err(RuntimeError::TypeMismatch(format!(
            "cannot branch on {}",
            other.type_name()
        ))),
    }
}

fn array_index(value: &Value) -> Result<usize, RuntimeError> {
    match value {
        Value::I32(i) if *i >= 0 => Ok(*i as usize),
        other => Err(RuntimeError::TypeMismatch(format!(
            "invalid array index {}",
            other
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{LocalDecl, LocalIndex, MethodSig, ModuleBuilder};

    #[test]
    fn test_loop_with_labels() {
        // sum = 0; i = n; while i != 0 { sum += i; i -= 1 } return sum
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Math");
        builder.add_method(
            ty,
            "Sum",
            MethodSig::new_static(vec![TypeSig::I32], ReturnSig::Type(TypeSig::I32)),
            vec![LocalDecl { ty: TypeSig::I32 }],
            vec![
                Op::Label(LabelId(0)).into(),
                Op::LdArg(0).into(),
                Op::BrFalse(LabelId(1)).into(),
                Op::LdLoc(LocalIndex(0)).into(),
                Op::LdArg(0).into(),
                Op::Add.into(),
                Op::StLoc(LocalIndex(0)).into(),
                Op::LdArg(0).into(),
                Op::LdcI4(1).into(),
                Op::Sub.into(),
                Op::StArg(0).into(),
                Op::Br(LabelId(0)).into(),
                Op::Label(LabelId(1)).into(),
                Op::LdLoc(LocalIndex(0)).into(),
                Op::Ret.into(),
            ],
        );
        let module = builder.finish();

        let mut machine = Machine::new(&module, ExecutionContext::default());
        let result = machine.invoke_named("Math", "Sum", vec![Value::I32(4)]).unwrap();
        assert_eq!(result, Some(Value::I32(10)));
    }

    #[test]
    fn test_native_and_indirect_calls() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Host");
        let twice = builder.add_native(
            ty,
            "Twice",
            MethodSig::new_static(vec![TypeSig::I64], ReturnSig::Type(TypeSig::I64)),
        );
        builder.add_method(
            ty,
            "Run",
            MethodSig::new_static(vec![], ReturnSig::Type(TypeSig::I64)),
            vec![],
            vec![
                Op::LdcI8(21).into(),
                Op::LdFtn(twice).into(),
                Instruction::Call(CallTarget::Indirect { arity: 1 }),
                Op::Ret.into(),
            ],
        );
        let module = builder.finish();

        let mut machine = Machine::new(&module, ExecutionContext::default());
        machine
            .register_native("Host", "Twice", |_, args| match args {
                [Value::I64(v)] => Ok(Some(Value::I64(v * 2))),
                _ => Ok(None),
            })
            .unwrap();
        let result = machine.invoke_named("Host", "Run", vec![]).unwrap();
        assert_eq!(result, Some(Value::I64(42)));
    }

    #[test]
    fn test_missing_native() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Host");
        builder.add_native(ty, "Beep", MethodSig::new_static(vec![], ReturnSig::Void));
        let module = builder.finish();

        let mut machine = Machine::new(&module, ExecutionContext::default());
        let err = machine.invoke_named("Host", "Beep", vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::MissingNative(name) if name == "Host::Beep"));
    }

    #[test]
    fn test_step_limit() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Spin");
        builder.add_method(
            ty,
            "Forever",
            MethodSig::new_static(vec![], ReturnSig::Void),
            vec![],
            vec![Op::Label(LabelId(0)).into(), Op::Br(LabelId(0)).into()],
        );
        let module = builder.finish();

        let mut machine = Machine::new(&module, ExecutionContext::default()).with_limits(
            ExecutionLimits {
                max_call_depth: 8,
                max_steps: 100,
            },
        );
        let err = machine.invoke_named("Spin", "Forever", vec![]).unwrap_err();
        assert!(matches!(err, RuntimeError::StepLimitExceeded(100)));
    }

    #[test]
    fn test_coerce() {
        assert_eq!(
            coerce(Value::boxed(Value::I32(1)), &TypeSig::I32).unwrap(),
            Value::I32(1)
        );
        assert!(coerce(Value::boxed(Value::I64(1)), &TypeSig::I32).is_err());
        assert!(coerce(Value::I32(1), &TypeSig::I32).is_err());
        assert_eq!(coerce(Value::Null, &TypeSig::String).unwrap(), Value::Null);
        assert!(coerce(Value::boxed(Value::I32(1)), &TypeSig::String).is_err());
    }
}
