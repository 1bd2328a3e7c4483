//! Instructions of the host stack machine.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::{LocalIndex, MethodToken, TypeSig, TypeToken};

/// Branch target marker. Labels are pseudo-instructions, so inserting code
/// never shifts a branch target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct LabelId(pub u32);

/// Operand of `ldtoken`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MetadataToken {
    Type(TypeToken),
    Method(MethodToken),
}

/// What a call instruction invokes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CallTarget {
    /// Statically known method.
    Direct(MethodToken),
    /// Function value on top of the stack, above `arity` arguments
    /// (receiver included). The target is only known at run time.
    Indirect { arity: u16 },
}

/// One entry of a method body.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Instruction {
    Call(CallTarget),
    Other(Op),
}

impl Instruction {
    pub fn call(method: MethodToken) -> Self {
        Instruction::Call(CallTarget::Direct(method))
    }

    pub fn is_call(&self) -> bool {
        matches!(self, Instruction::Call(_))
    }
}

impl From<Op> for Instruction {
    fn from(op: Op) -> Self {
        Instruction::Other(op)
    }
}

/// Every non-call opcode.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Op {
    Nop,
    LdArg(u16),
    StArg(u16),
    LdLoc(LocalIndex),
    StLoc(LocalIndex),
    LdNull,
    LdcI4(i32),
    LdcI8(i64),
    LdcR8(f64),
    LdStr(String),
    Dup,
    Pop,
    Add,
    Sub,
    Mul,
    Ceq,
    Clt,
    Label(LabelId),
    Br(LabelId),
    BrTrue(LabelId),
    BrFalse(LabelId),
    Ret,
    Box(TypeSig),
    UnboxAny(TypeSig),
    NewObj(TypeToken),
    NewArr(TypeSig),
    StElemRef,
    LdElemRef,
    LdLen,
    LdToken(MetadataToken),
    LdFtn(MethodToken),
    /// Pops a method token and a type token, pushes the method identity.
    ResolveMethod,
    /// Pushes the currently installed interceptor.
    GetInterceptor,
    /// Pops interceptor, receiver, argument array and method identity;
    /// pushes the interceptor's result.
    Intercept,
}

impl fmt::Display for Op {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Op::Nop => write!(f, "nop"),
            Op::LdArg(idx) => write!(f, "ldarg {}", idx),
            Op::StArg(idx) => write!(f, "starg {}", idx),
            Op::LdLoc(idx) => write!(f, "ldloc {}", idx.0),
            Op::StLoc(idx) => write!(f, "stloc {}", idx.0),
            Op::LdNull => write!(f, "ldnull"),
            Op::LdcI4(v) => write!(f, "ldc.i4 {}", v),
            Op::LdcI8(v) => write!(f, "ldc.i8 {}", v),
            Op::LdcR8(v) => write!(f, "ldc.r8 {}", v),
            Op::LdStr(s) => write!(f, "ldstr {:?}", s),
            Op::Dup => write!(f, "dup"),
            Op::Pop => write!(f, "pop"),
            Op::Add => write!(f, "add"),
            Op::Sub => write!(f, "sub"),
            Op::Mul => write!(f, "mul"),
            Op::Ceq => write!(f, "ceq"),
            Op::Clt => write!(f, "clt"),
            Op::Label(l) => write!(f, "L{}:", l.0),
            Op::Br(l) => write!(f, "br L{}", l.0),
            Op::BrTrue(l) => write!(f, "brtrue L{}", l.0),
            Op::BrFalse(l) => write!(f, "brfalse L{}", l.0),
            Op::Ret => write!(f, "ret"),
            Op::Box(ty) => write!(f, "box {}", ty),
            Op::UnboxAny(ty) => write!(f, "unbox.any {}", ty),
            Op::NewObj(ty) => write!(f, "newobj {}", ty),
            Op::NewArr(ty) => write!(f, "newarr {}", ty),
            Op::StElemRef => write!(f, "stelem.ref"),
            Op::LdElemRef => write!(f, "ldelem.ref"),
            Op::LdLen => write!(f, "ldlen"),
            Op::LdToken(MetadataToken::Type(t)) => write!(f, "ldtoken {}", t),
            Op::LdToken(MetadataToken::Method(m)) => write!(f, "ldtoken {}", m),
            Op::LdFtn(m) => write!(f, "ldftn {}", m),
            Op::ResolveMethod => write!(f, "resolve.method"),
            Op::GetInterceptor => write!(f, "get.interceptor"),
            Op::Intercept => write!(f, "intercept"),
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Instruction::Call(CallTarget::Direct(m)) => write!(f, "call {}", m),
            Instruction::Call(CallTarget::Indirect { arity }) => write!(f, "calli {}", arity),
            Instruction::Other(op) => write!(f, "{}", op),
        }
    }
}
