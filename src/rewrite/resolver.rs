//! Signature resolution for call instructions.

use crate::il::{
    CallTarget, Instruction, MethodToken, Module, ReturnSig, TypeSig, TypeToken, ValueCategory,
};

/// One declared parameter of a callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParamDescriptor {
    pub ty: TypeSig,
    pub category: ValueCategory,
}

/// Return type of a callee.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReturnDescriptor {
    Void,
    Value { ty: TypeSig, category: ValueCategory },
}

/// Everything the rewriter needs to know about the target of a call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Callee {
    pub method: MethodToken,
    pub declaring_type: TypeToken,
    pub params: Vec<ParamDescriptor>,
    pub ret: ReturnDescriptor,
    pub is_static: bool,
}

impl Callee {
    pub fn param_count(&self) -> usize {
        self.params.len()
    }
}

/// Why a call instruction could not be described.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Unresolvable {
    NotACall,
    Indirect,
    UnknownMethod(MethodToken),
    UnknownDeclaringType(MethodToken),
}

impl std::fmt::Display for Unresolvable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Unresolvable::NotACall => write!(f, "instruction is not a call"),
            Unresolvable::Indirect => write!(f, "indirect call has no static target"),
            Unresolvable::UnknownMethod(m) => write!(f, "{} is not defined in the module", m),
            Unresolvable::UnknownDeclaringType(m) => {
                write!(f, "declaring type of {} is not defined in the module", m)
            }
        }
    }
}

/// Describes callees using the metadata of one module.
pub struct SignatureResolver<'m> {
    module: &'m Module,
}

impl<'m> SignatureResolver<'m> {
    pub fn new(module: &'m Module) -> Self {
        Self { module }
    }

    pub fn describe(&self, instruction: &Instruction) -> Result<Callee, Unresolvable> {
        let token = match instruction {
            Instruction::Call(CallTarget::Direct(token)) => *token,
            Instruction::Call(CallTarget::Indirect { .. }) => return Err(Unresolvable::Indirect),
            Instruction::Other(_) => return Err(Unresolvable::NotACall),
        };

        let method = self
            .module
            .method(token)
            .ok_or(Unresolvable::UnknownMethod(token))?;
        if self.module.type_def(method.declaring_type).is_none() {
            return Err(Unresolvable::UnknownDeclaringType(token));
        }

        let sig = &method.signature;
        let params = sig
            .params
            .iter()
            .map(|ty| ParamDescriptor {
                ty: ty.clone(),
                category: ty.category(),
            })
            .collect();
        let ret = match &sig.ret {
            ReturnSig::Void => ReturnDescriptor::Void,
            ReturnSig::Type(ty) => ReturnDescriptor::Value {
                ty: ty.clone(),
                category: ty.category(),
            },
        };

        Ok(Callee {
            method: token,
            declaring_type: method.declaring_type,
            params,
            ret,
            is_static: sig.is_static,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{MethodSig, ModuleBuilder, Op};

    #[test]
    fn test_describe_instance_call() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Calc");
        let add = builder.add_native(
            ty,
            "Add",
            MethodSig::new_instance(
                vec![TypeSig::I32, TypeSig::String],
                ReturnSig::Type(TypeSig::I64),
            ),
        );
        let module = builder.finish();

        let callee = SignatureResolver::new(&module)
            .describe(&Instruction::call(add))
            .unwrap();
        assert_eq!(callee.method, add);
        assert_eq!(callee.declaring_type, ty);
        assert!(!callee.is_static);
        assert_eq!(callee.param_count(), 2);
        assert_eq!(callee.params[0].category, ValueCategory::ByValueType);
        assert_eq!(callee.params[1].category, ValueCategory::ByReferenceType);
        assert_eq!(
            callee.ret,
            ReturnDescriptor::Value {
                ty: TypeSig::I64,
                category: ValueCategory::ByValueType
            }
        );
    }

    #[test]
    fn test_describe_failures() {
        let module = ModuleBuilder::new("m").finish();
        let resolver = SignatureResolver::new(&module);

        assert_eq!(
            resolver.describe(&Op::Nop.into()),
            Err(Unresolvable::NotACall)
        );
        assert_eq!(
            resolver.describe(&Instruction::Call(CallTarget::Indirect { arity: 1 })),
            Err(Unresolvable::Indirect)
        );
        assert_eq!(
            resolver.describe(&Instruction::call(MethodToken(4))),
            Err(Unresolvable::UnknownMethod(MethodToken(4)))
        );
    }
}
