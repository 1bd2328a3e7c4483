//! Instruction model
//!
//! The in-memory form of a loaded module: types, methods, signatures and the
//! linear instruction streams of method bodies.
//!
//! The rewriter only distinguishes call instructions from everything else.
//! Every other opcode lives in [`Op`] and is passed through verbatim; only the
//! [`Machine`](crate::runtime::Machine) interprets it.

mod builder;
pub mod codec;
mod instruction;

pub use builder::ModuleBuilder;
pub use codec::{decode, decode_with_limits, encode, fingerprint, CodecError, Limits};
pub use instruction::{CallTarget, Instruction, LabelId, MetadataToken, Op};

use serde::{Deserialize, Serialize};
use std::fmt;

/// Index into [`Module::types`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TypeToken(pub u32);

/// Index into [`Module::methods`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MethodToken(pub u32);

/// Most locals one method body can declare and still be encoded.
pub const MAX_LOCALS: u32 = u16::MAX as u32;

/// Index into a method body's local slot table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LocalIndex(pub u32);

impl fmt::Display for TypeToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "type#{}", self.0)
    }
}

impl fmt::Display for MethodToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "method#{}", self.0)
    }
}

/// How a value is stored: directly, or as a reference to heap data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ValueCategory {
    ByValueType,
    ByReferenceType,
}

/// Declared type of a parameter, return value, or local slot.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TypeSig {
    Bool,
    I32,
    I64,
    F64,
    String,
    Object,
    ObjectArray,
    Class(TypeToken),
}

impl TypeSig {
    pub fn category(&self) -> ValueCategory {
        match self {
            TypeSig::Bool | TypeSig::I32 | TypeSig::I64 | TypeSig::F64 => {
                ValueCategory::ByValueType
            }
            TypeSig::String | TypeSig::Object | TypeSig::ObjectArray | TypeSig::Class(_) => {
                ValueCategory::ByReferenceType
            }
        }
    }

    pub fn is_value_type(&self) -> bool {
        self.category() == ValueCategory::ByValueType
    }
}

impl fmt::Display for TypeSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TypeSig::Bool => write!(f, "bool"),
            TypeSig::I32 => write!(f, "int32"),
            TypeSig::I64 => write!(f, "int64"),
            TypeSig::F64 => write!(f, "float64"),
            TypeSig::String => write!(f, "string"),
            TypeSig::Object => write!(f, "object"),
            TypeSig::ObjectArray => write!(f, "object[]"),
            TypeSig::Class(token) => write!(f, "class {}", token),
        }
    }
}

/// Declared return type of a method.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ReturnSig {
    Void,
    Type(TypeSig),
}

impl fmt::Display for ReturnSig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReturnSig::Void => write!(f, "void"),
            ReturnSig::Type(ty) => write!(f, "{}", ty),
        }
    }
}

/// A method signature as declared in metadata.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MethodSig {
    pub params: Vec<TypeSig>,
    pub ret: ReturnSig,
    pub is_static: bool,
}

impl MethodSig {
    pub fn new_static(params: Vec<TypeSig>, ret: ReturnSig) -> Self {
        Self {
            params,
            ret,
            is_static: true,
        }
    }

    pub fn new_instance(params: Vec<TypeSig>, ret: ReturnSig) -> Self {
        Self {
            params,
            ret,
            is_static: false,
        }
    }

    /// Number of values a call consumes from the evaluation stack,
    /// including the receiver of an instance method.
    pub fn stack_arity(&self) -> usize {
        self.params.len() + usize::from(!self.is_static)
    }
}

/// A declared local slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LocalDecl {
    pub ty: TypeSig,
}

/// Locals plus the linear instruction stream of one method.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MethodBody {
    pub locals: Vec<LocalDecl>,
    pub instructions: Vec<Instruction>,
}

impl MethodBody {
    pub fn new(locals: Vec<LocalDecl>, instructions: Vec<Instruction>) -> Self {
        Self {
            locals,
            instructions,
        }
    }

    /// Number of call instructions (direct or indirect) in the body.
    pub fn call_sites(&self) -> usize {
        self.instructions.iter().filter(|i| i.is_call()).count()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeDef {
    pub name: String,
    pub methods: Vec<MethodToken>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MethodDef {
    pub declaring_type: TypeToken,
    pub name: String,
    pub signature: MethodSig,
    /// `None` for methods implemented natively by the host.
    pub body: Option<MethodBody>,
}

/// A loaded module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Module {
    pub name: String,
    pub types: Vec<TypeDef>,
    pub methods: Vec<MethodDef>,
}

impl Module {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            types: Vec::new(),
            methods: Vec::new(),
        }
    }

    pub fn type_def(&self, token: TypeToken) -> Option<&TypeDef> {
        self.types.get(token.0 as usize)
    }

    pub fn method(&self, token: MethodToken) -> Option<&MethodDef> {
        self.methods.get(token.0 as usize)
    }

    pub fn method_mut(&mut self, token: MethodToken) -> Option<&mut MethodDef> {
        self.methods.get_mut(token.0 as usize)
    }

    pub fn find_type(&self, name: &str) -> Option<TypeToken> {
        self.types
            .iter()
            .position(|t| t.name == name)
            .map(|idx| TypeToken(idx as u32))
    }

    /// Find the first method called `name` declared on `ty`.
    pub fn find_method(&self, ty: TypeToken, name: &str) -> Option<MethodToken> {
        let def = self.type_def(ty)?;
        def.methods
            .iter()
            .copied()
            .find(|&token| self.method(token).is_some_and(|m| m.name == name))
    }

    /// `Type::method` form of a method's name, for diagnostics.
    pub fn qualified_name(&self, token: MethodToken) -> String {
        match self.method(token) {
            Some(method) => {
                let type_name = self
                    .type_def(method.declaring_type)
                    .map(|t| t.name.as_str())
                    .unwrap_or("?");
                format!("{}::{}", type_name, method.name)
            }
            None => format!("<{}>", token),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_categories() {
        assert_eq!(TypeSig::I32.category(), ValueCategory::ByValueType);
        assert_eq!(TypeSig::Bool.category(), ValueCategory::ByValueType);
        assert_eq!(TypeSig::String.category(), ValueCategory::ByReferenceType);
        assert_eq!(
            TypeSig::Class(TypeToken(3)).category(),
            ValueCategory::ByReferenceType
        );
    }

    #[test]
    fn test_find_method() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Sample");
        let other = builder.add_type("Other");
        builder.add_native(other, "Run", MethodSig::new_static(vec![], ReturnSig::Void));
        let run = builder.add_native(ty, "Run", MethodSig::new_static(vec![], ReturnSig::Void));
        let module = builder.finish();

        assert_eq!(module.find_type("Sample"), Some(ty));
        assert_eq!(module.find_method(ty, "Run"), Some(run));
        assert_eq!(module.find_method(ty, "Missing"), None);
        assert_eq!(module.qualified_name(run), "Sample::Run");
    }

    #[test]
    fn test_stack_arity() {
        let sig = MethodSig::new_instance(vec![TypeSig::I32, TypeSig::String], ReturnSig::Void);
        assert_eq!(sig.stack_arity(), 3);
        let sig = MethodSig::new_static(vec![TypeSig::I32], ReturnSig::Void);
        assert_eq!(sig.stack_arity(), 1);
    }
}
