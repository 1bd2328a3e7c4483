//! Binary module format
//!
//! Layout (little-endian):
//!
//! ```text
//! magic "CWIL" | version u16 | flags u16 | name
//! types:   count u32, then { name, method count u32, method tokens u32* }
//! methods: count u32, then { declaring type u32, name, signature, has body u8, body? }
//! body:    local count u32, type sigs, instruction count u32, instructions
//! ```
//!
//! Strings are a u32 byte length followed by UTF-8. Every token is checked
//! against the tables it indexes before a module is handed out.

use sha2::{Digest, Sha256};
use thiserror::Error;

use super::{
    CallTarget, Instruction, LabelId, LocalDecl, LocalIndex, MetadataToken, MethodBody,
    MethodDef, MethodSig, MethodToken, Module, Op, ReturnSig, TypeDef, TypeSig, TypeToken,
    MAX_LOCALS,
};

#[derive(Error, Debug)]
pub enum CodecError {
    #[error("Invalid encoding: {0}")]
    InvalidEncoding(String),

    #[error("Buffer too small: need {need} bytes, have {have}")]
    BufferTooSmall { need: usize, have: usize },

    #[error("Invalid {what} tag: {tag:#04x}")]
    InvalidTag { what: &'static str, tag: u8 },

    #[error("{what} {index} out of range in {context}")]
    OutOfRange {
        what: &'static str,
        index: u32,
        context: String,
    },
}

const MAGIC: u32 = u32::from_le_bytes(*b"CWIL");
const VERSION: u16 = 1;

#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_buffer_size: usize,
    pub max_types: usize,
    pub max_methods: usize,
    pub max_instructions: usize,
    pub max_string_len: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_buffer_size: 64 * 1024 * 1024,
            max_types: 1 << 20,
            max_methods: 1 << 20,
            max_instructions: 1 << 22,
            max_string_len: 1 << 20,
        }
    }
}

// Type signature tags
const SIG_BOOL: u8 = 0x01;
const SIG_I32: u8 = 0x02;
const SIG_I64: u8 = 0x03;
const SIG_F64: u8 = 0x04;
const SIG_STRING: u8 = 0x05;
const SIG_OBJECT: u8 = 0x06;
const SIG_OBJECT_ARRAY: u8 = 0x07;
const SIG_CLASS: u8 = 0x08;

const RET_VOID: u8 = 0x00;
const RET_TYPE: u8 = 0x01;

// Opcodes
const OP_NOP: u8 = 0x00;
const OP_LDARG: u8 = 0x01;
const OP_STARG: u8 = 0x02;
const OP_LDLOC: u8 = 0x03;
const OP_STLOC: u8 = 0x04;
const OP_LDNULL: u8 = 0x05;
const OP_LDC_I4: u8 = 0x06;
const OP_LDC_I8: u8 = 0x07;
const OP_LDC_R8: u8 = 0x08;
const OP_LDSTR: u8 = 0x09;
const OP_DUP: u8 = 0x0A;
const OP_POP: u8 = 0x0B;
const OP_ADD: u8 = 0x0C;
const OP_SUB: u8 = 0x0D;
const OP_MUL: u8 = 0x0E;
const OP_CEQ: u8 = 0x0F;
const OP_CLT: u8 = 0x10;
const OP_LABEL: u8 = 0x11;
const OP_BR: u8 = 0x12;
const OP_BRTRUE: u8 = 0x13;
const OP_BRFALSE: u8 = 0x14;
const OP_RET: u8 = 0x15;
const OP_BOX: u8 = 0x16;
const OP_UNBOX_ANY: u8 = 0x17;
const OP_NEWOBJ: u8 = 0x18;
const OP_NEWARR: u8 = 0x19;
const OP_STELEM_REF: u8 = 0x1A;
const OP_LDELEM_REF: u8 = 0x1B;
const OP_LDLEN: u8 = 0x1C;
const OP_LDTOKEN_TYPE: u8 = 0x1D;
const OP_LDTOKEN_METHOD: u8 = 0x1E;
const OP_LDFTN: u8 = 0x1F;
const OP_RESOLVE_METHOD: u8 = 0x20;
const OP_GET_INTERCEPTOR: u8 = 0x21;
const OP_INTERCEPT: u8 = 0x22;
const OP_CALL: u8 = 0x40;
const OP_CALLI: u8 = 0x41;

/// Encode a module to bytes.
pub fn encode(module: &Module) -> Vec<u8> {
    let mut w = Writer::default();
    w.u32(MAGIC);
    w.u16(VERSION);
    w.u16(0);
    w.str(&module.name);

    w.u32(module.types.len() as u32);
    for ty in &module.types {
        w.str(&ty.name);
        w.u32(ty.methods.len() as u32);
        for method in &ty.methods {
            w.u32(method.0);
        }
    }

    w.u32(module.methods.len() as u32);
    for method in &module.methods {
        w.u32(method.declaring_type.0);
        w.str(&method.name);
        w.method_sig(&method.signature);
        match &method.body {
            None => w.u8(0),
            Some(body) => {
                w.u8(1);
                w.u32(body.locals.len() as u32);
                for local in &body.locals {
                    w.type_sig(&local.ty);
                }
                w.u32(body.instructions.len() as u32);
                for inst in &body.instructions {
                    w.instruction(inst);
                }
            }
        }
    }

    w.bytes
}

/// Decode a module with default [`Limits`].
pub fn decode(bytes: &[u8]) -> Result<Module, CodecError> {
    decode_with_limits(bytes, &Limits::default())
}

pub fn decode_with_limits(bytes: &[u8], limits: &Limits) -> Result<Module, CodecError> {
    if bytes.len() > limits.max_buffer_size {
        return Err(CodecError::InvalidEncoding("Buffer too large".to_string()));
    }

    let mut cursor = Cursor::new(bytes, limits);
    if cursor.read_u32()? != MAGIC {
        return Err(CodecError::InvalidEncoding("Invalid magic".to_string()));
    }
    if cursor.read_u16()? != VERSION {
        return Err(CodecError::InvalidEncoding("Unsupported version".to_string()));
    }
    let _flags = cursor.read_u16()?;
    let name = cursor.read_string()?;

    let type_count = cursor.read_count(limits.max_types, "type")?;
    let mut types = Vec::with_capacity(type_count);
    for _ in 0..type_count {
        let name = cursor.read_string()?;
        let method_count = cursor.read_count(limits.max_methods, "type method")?;
        let mut methods = Vec::with_capacity(method_count);
        for _ in 0..method_count {
            methods.push(MethodToken(cursor.read_u32()?));
        }
        types.push(TypeDef { name, methods });
    }

    let method_count = cursor.read_count(limits.max_methods, "method")?;
    let mut methods = Vec::with_capacity(method_count);
    for _ in 0..method_count {
        let declaring_type = TypeToken(cursor.read_u32()?);
        let name = cursor.read_string()?;
        let signature = cursor.read_method_sig()?;
        let body = match cursor.read_u8()? {
            0 => None,
            1 => {
                let local_count = cursor.read_count(MAX_LOCALS as usize, "local")?;
                let mut locals = Vec::with_capacity(local_count);
                for _ in 0..local_count {
                    locals.push(LocalDecl {
                        ty: cursor.read_type_sig()?,
                    });
                }
                let inst_count = cursor.read_count(limits.max_instructions, "instruction")?;
                let mut instructions = Vec::with_capacity(inst_count);
                for _ in 0..inst_count {
                    instructions.push(cursor.read_instruction()?);
                }
                Some(MethodBody::new(locals, instructions))
            }
            tag => return Err(CodecError::InvalidTag { what: "body", tag }),
        };
        methods.push(MethodDef {
            declaring_type,
            name,
            signature,
            body,
        });
    }

    if !cursor.is_eof() {
        return Err(CodecError::InvalidEncoding("Trailing bytes".to_string()));
    }

    let module = Module {
        name,
        types,
        methods,
    };
    validate_tokens(&module)?;
    Ok(module)
}

/// SHA-256 of an encoded module, lowercase hex.
pub fn fingerprint(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

fn validate_tokens(module: &Module) -> Result<(), CodecError> {
    let type_count = module.types.len() as u32;
    let method_count = module.methods.len() as u32;

    let check_type = |token: TypeToken, context: &str| {
        if token.0 >= type_count {
            return Err(CodecError::OutOfRange {
                what: "type token",
                index: token.0,
                context: context.to_string(),
            });
        }
        Ok(())
    };
    let check_method = |token: MethodToken, context: &str| {
        if token.0 >= method_count {
            return Err(CodecError::OutOfRange {
                what: "method token",
                index: token.0,
                context: context.to_string(),
            });
        }
        Ok(())
    };
    let check_sig = |sig: &TypeSig, context: &str| match sig {
        TypeSig::Class(token) => check_type(*token, context),
        _ => Ok(()),
    };

    for ty in &module.types {
        for &method in &ty.methods {
            check_method(method, &ty.name)?;
        }
    }

    for (idx, method) in module.methods.iter().enumerate() {
        let context = format!("method {} ({})", idx, method.name);
        check_type(method.declaring_type, &context)?;
        for param in &method.signature.params {
            check_sig(param, &context)?;
        }
        if let ReturnSig::Type(ret) = &method.signature.ret {
            check_sig(ret, &context)?;
        }

        let Some(body) = &method.body else { continue };
        for local in &body.locals {
            check_sig(&local.ty, &context)?;
        }
        let local_count = body.locals.len() as u32;
        for inst in &body.instructions {
            match inst {
                Instruction::Call(CallTarget::Direct(target)) => check_method(*target, &context)?,
                Instruction::Call(CallTarget::Indirect { .. }) => {}
                Instruction::Other(op) => match op {
                    Op::LdLoc(local) | Op::StLoc(local) if local.0 >= local_count => {
                        return Err(CodecError::OutOfRange {
                            what: "local",
                            index: local.0,
                            context,
                        });
                    }
                    Op::Box(sig) | Op::UnboxAny(sig) | Op::NewArr(sig) => {
                        check_sig(sig, &context)?
                    }
                    Op::NewObj(ty) | Op::LdToken(MetadataToken::Type(ty)) => {
                        check_type(*ty, &context)?
                    }
                    Op::LdToken(MetadataToken::Method(m)) | Op::LdFtn(m) => {
                        check_method(*m, &context)?
                    }
                    _ => {}
                },
            }
        }
    }

    Ok(())
}

#[derive(Default)]
struct Writer {
    bytes: Vec<u8>,
}

impl Writer {
    fn u8(&mut self, value: u8) {
        self.bytes.push(value);
    }

    fn u16(&mut self, value: u16) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u32(&mut self, value: u32) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn u64(&mut self, value: u64) {
        self.bytes.extend_from_slice(&value.to_le_bytes());
    }

    fn str(&mut self, value: &str) {
        self.u32(value.len() as u32);
        self.bytes.extend_from_slice(value.as_bytes());
    }

    fn type_sig(&mut self, sig: &TypeSig) {
        match sig {
            TypeSig::Bool => self.u8(SIG_BOOL),
            TypeSig::I32 => self.u8(SIG_I32),
            TypeSig::I64 => self.u8(SIG_I64),
            TypeSig::F64 => self.u8(SIG_F64),
            TypeSig::String => self.u8(SIG_STRING),
            TypeSig::Object => self.u8(SIG_OBJECT),
            TypeSig::ObjectArray => self.u8(SIG_OBJECT_ARRAY),
            TypeSig::Class(token) => {
                self.u8(SIG_CLASS);
                self.u32(token.0);
            }
        }
    }

    fn method_sig(&mut self, sig: &MethodSig) {
        self.u32(sig.params.len() as u32);
        for param in &sig.params {
            self.type_sig(param);
        }
        match &sig.ret {
            ReturnSig::Void => self.u8(RET_VOID),
            ReturnSig::Type(ty) => {
                self.u8(RET_TYPE);
                self.type_sig(ty);
            }
        }
        self.u8(u8::from(sig.is_static));
    }

    fn instruction(&mut self, inst: &Instruction) {
        let op = match inst {
            Instruction::Call(CallTarget::Direct(method)) => {
                self.u8(OP_CALL);
                self.u32(method.0);
                return;
            }
            Instruction::Call(CallTarget::Indirect { arity }) => {
                self.u8(OP_CALLI);
                self.u16(*arity);
                return;
            }
            Instruction::Other(op) => op,
        };

        match op {
            Op::Nop => self.u8(OP_NOP),
            Op::LdArg(idx) => {
                self.u8(OP_LDARG);
                self.u16(*idx);
            }
            Op::StArg(idx) => {
                self.u8(OP_STARG);
                self.u16(*idx);
            }
            Op::LdLoc(idx) => {
                self.u8(OP_LDLOC);
                self.u32(idx.0);
            }
            Op::StLoc(idx) => {
                self.u8(OP_STLOC);
                self.u32(idx.0);
            }
            Op::LdNull => self.u8(OP_LDNULL),
            Op::LdcI4(v) => {
                self.u8(OP_LDC_I4);
                self.u32(*v as u32);
            }
            Op::LdcI8(v) => {
                self.u8(OP_LDC_I8);
                self.u64(*v as u64);
            }
            Op::LdcR8(v) => {
                self.u8(OP_LDC_R8);
                self.u64(v.to_bits());
            }
            Op::LdStr(s) => {
                self.u8(OP_LDSTR);
                self.str(s);
            }
            Op::Dup => self.u8(OP_DUP),
            Op::Pop => self.u8(OP_POP),
            Op::Add => self.u8(OP_ADD),
            Op::Sub => self.u8(OP_SUB),
            Op::Mul => self.u8(OP_MUL),
            Op::Ceq => self.u8(OP_CEQ),
            Op::Clt => self.u8(OP_CLT),
            Op::Label(l) => {
                self.u8(OP_LABEL);
                self.u32(l.0);
            }
            Op::Br(l) => {
                self.u8(OP_BR);
                self.u32(l.0);
            }
            Op::BrTrue(l) => {
                self.u8(OP_BRTRUE);
                self.u32(l.0);
            }
            Op::BrFalse(l) => {
                self.u8(OP_BRFALSE);
                self.u32(l.0);
            }
            Op::Ret => self.u8(OP_RET),
            Op::Box(sig) => {
                self.u8(OP_BOX);
                self.type_sig(sig);
            }
            Op::UnboxAny(sig) => {
                self.u8(OP_UNBOX_ANY);
                self.type_sig(sig);
            }
            Op::NewObj(ty) => {
                self.u8(OP_NEWOBJ);
                self.u32(ty.0);
            }
            Op::NewArr(sig) => {
                self.u8(OP_NEWARR);
                self.type_sig(sig);
            }
            Op::StElemRef => self.u8(OP_STELEM_REF),
            Op::LdElemRef => self.u8(OP_LDELEM_REF),
            Op::LdLen => self.u8(OP_LDLEN),
            Op::LdToken(MetadataToken::Type(ty)) => {
                self.u8(OP_LDTOKEN_TYPE);
                self.u32(ty.0);
            }
            Op::LdToken(MetadataToken::Method(m)) => {
                self.u8(OP_LDTOKEN_METHOD);
                self.u32(m.0);
            }
            Op::LdFtn(m) => {
                self.u8(OP_LDFTN);
                self.u32(m.0);
            }
            Op::ResolveMethod => self.u8(OP_RESOLVE_METHOD),
            Op::GetInterceptor => self.u8(OP_GET_INTERCEPTOR),
            Op::Intercept => self.u8(OP_INTERCEPT),
        }
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    limits: &'a Limits,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8], limits: &'a Limits) -> Self {
        Self {
            bytes,
            pos: 0,
            limits,
        }
    }

    fn is_eof(&self) -> bool {
        self.pos >= self.bytes.len()
    }

    fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], CodecError> {
        if self.pos + len > self.bytes.len() {
            return Err(CodecError::BufferTooSmall {
                need: self.pos + len,
                have: self.bytes.len(),
            });
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..self.pos])
    }

    fn read_u8(&mut self) -> Result<u8, CodecError> {
        let bytes = self.read_bytes(1)?;
        Ok(bytes[0])
    }

    fn read_u16(&mut self) -> Result<u16, CodecError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    fn read_u32(&mut self) -> Result<u32, CodecError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    fn read_u64(&mut self) -> Result<u64, CodecError> {
        let bytes = self.read_bytes(8)?;
        Ok(u64::from_le_bytes([
            bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
        ]))
    }

    fn read_count(&mut self, max: usize, what: &str) -> Result<usize, CodecError> {
        let count = self.read_u32()? as usize;
        if count > max {
            return Err(CodecError::InvalidEncoding(format!(
                "{} count {} exceeds limit {}",
                what, count, max
            )));
        }
        Ok(count)
    }

    fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_u32()? as usize;
        if len > self.limits.max_string_len {
            return Err(CodecError::InvalidEncoding("String too long".to_string()));
        }
        let bytes = self.read_bytes(len)?;
        std::str::from_utf8(bytes)
            .map(str::to_string)
            .map_err(|_| CodecError::InvalidEncoding("Invalid UTF-8 string".to_string()))
    }

    fn read_type_sig(&mut self) -> Result<TypeSig, CodecError> {
        match self.read_u8()? {
            SIG_BOOL => Ok(TypeSig::Bool),
            SIG_I32 => Ok(TypeSig::I32),
            SIG_I64 => Ok(TypeSig::I64),
            SIG_F64 => Ok(TypeSig::F64),
            SIG_STRING => Ok(TypeSig::String),
            SIG_OBJECT => Ok(TypeSig::Object),
            SIG_OBJECT_ARRAY => Ok(TypeSig::ObjectArray),
            SIG_CLASS => Ok(TypeSig::Class(TypeToken(self.read_u32()?))),
            tag => Err(CodecError::InvalidTag {
                what: "type signature",
                tag,
            }),
        }
    }

    fn read_method_sig(&mut self) -> Result<MethodSig, CodecError> {
        let param_count = self.read_count(u16::MAX as usize, "parameter")?;
        let mut params = Vec::with_capacity(param_count);
        for _ in 0..param_count {
            params.push(self.read_type_sig()?);
        }
        let ret = match self.read_u8()? {
            RET_VOID => ReturnSig::Void,
            RET_TYPE => ReturnSig::Type(self.read_type_sig()?),
            tag => return Err(CodecError::InvalidTag { what: "return", tag }),
        };
        let is_static = match self.read_u8()? {
            0 => false,
            1 => true,
            tag => return Err(CodecError::InvalidTag { what: "static flag", tag }),
        };
        Ok(MethodSig {
            params,
            ret,
            is_static,
        })
    }

    fn read_instruction(&mut self) -> Result<Instruction, CodecError> {
        let op = match self.read_u8()? {
            OP_CALL => return Ok(Instruction::call(MethodToken(self.read_u32()?))),
            OP_CALLI => {
                return Ok(Instruction::Call(CallTarget::Indirect {
                    arity: self.read_u16()?,
                }))
            }
            OP_NOP => Op::Nop,
            OP_LDARG => Op::LdArg(self.read_u16()?),
            OP_STARG => Op::StArg(self.read_u16()?),
            OP_LDLOC => Op::LdLoc(LocalIndex(self.read_u32()?)),
            OP_STLOC => Op::StLoc(LocalIndex(self.read_u32()?)),
            OP_LDNULL => Op::LdNull,
            OP_LDC_I4 => Op::LdcI4(self.read_u32()? as i32),
            OP_LDC_I8 => Op::LdcI8(self.read_u64()? as i64),
            OP_LDC_R8 => Op::LdcR8(f64::from_bits(self.read_u64()?)),
            OP_LDSTR => Op::LdStr(self.read_string()?),
            OP_DUP => Op::Dup,
            OP_POP => Op::Pop,
            OP_ADD => Op::Add,
            OP_SUB => Op::Sub,
            OP_MUL => Op::Mul,
            OP_CEQ => Op::Ceq,
            OP_CLT => Op::Clt,
            OP_LABEL => Op::Label(LabelId(self.read_u32()?)),
            OP_BR => Op::Br(LabelId(self.read_u32()?)),
            OP_BRTRUE => Op::BrTrue(LabelId(self.read_u32()?)),
            OP_BRFALSE => Op::BrFalse(LabelId(self.read_u32()?)),
            OP_RET => Op::Ret,
            OP_BOX => Op::Box(self.read_type_sig()?),
            OP_UNBOX_ANY => Op::UnboxAny(self.read_type_sig()?),
            OP_NEWOBJ => Op::NewObj(TypeToken(self.read_u32()?)),
            OP_NEWARR => Op::NewArr(self.read_type_sig()?),
            OP_STELEM_REF => Op::StElemRef,
            OP_LDELEM_REF => Op::LdElemRef,
            OP_LDLEN => Op::LdLen,
            OP_LDTOKEN_TYPE => Op::LdToken(MetadataToken::Type(TypeToken(self.read_u32()?))),
            OP_LDTOKEN_METHOD => {
                Op::LdToken(MetadataToken::Method(MethodToken(self.read_u32()?)))
            }
            OP_LDFTN => Op::LdFtn(MethodToken(self.read_u32()?)),
            OP_RESOLVE_METHOD => Op::ResolveMethod,
            OP_GET_INTERCEPTOR => Op::GetInterceptor,
            OP_INTERCEPT => Op::Intercept,
            tag => return Err(CodecError::InvalidTag { what: "opcode", tag }),
        };
        Ok(Instruction::Other(op))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::ModuleBuilder;

    fn sample() -> Module {
        let mut builder = ModuleBuilder::new("sample");
        let console = builder.add_type("Console");
        let write_line = builder.add_native(
            console,
            "WriteLine",
            MethodSig::new_static(vec![TypeSig::String], ReturnSig::Void),
        );
        let sample = builder.add_type("Sample");
        builder.add_method(
            sample,
            "Run",
            MethodSig::new_instance(vec![TypeSig::I32], ReturnSig::Type(TypeSig::F64)),
            vec![LocalDecl { ty: TypeSig::Class(sample) }],
            vec![
                Op::LdStr("héllo".to_string()).into(),
                Instruction::call(write_line),
                Op::LdcR8(-1.5).into(),
                Op::LdcI8(i64::MIN).into(),
                Op::Pop.into(),
                Op::Ret.into(),
            ],
        );
        builder.finish()
    }

    #[test]
    fn test_encode_decode() {
        let module = sample();
        let bytes = encode(&module);
        let decoded = decode(&bytes).unwrap();
        assert_eq!(decoded, module);
        assert_eq!(encode(&decoded), bytes);
    }

    #[test]
    fn test_rejects_trailing_bytes() {
        let mut bytes = encode(&sample());
        bytes.push(0);
        assert!(matches!(decode(&bytes), Err(CodecError::InvalidEncoding(_))));
    }

    #[test]
    fn test_rejects_truncated() {
        let bytes = encode(&sample());
        let result = decode(&bytes[..bytes.len() - 1]);
        assert!(matches!(result, Err(CodecError::BufferTooSmall { .. })));
    }

    #[test]
    fn test_rejects_dangling_call() {
        let mut module = sample();
        let body = module.methods[1].body.as_mut().unwrap();
        body.instructions[1] = Instruction::call(MethodToken(99));
        let result = decode(&encode(&module));
        assert!(matches!(result, Err(CodecError::OutOfRange { what: "method token", index: 99, .. })));
    }

    #[test]
    fn test_fingerprint_is_stable() {
        let bytes = encode(&sample());
        assert_eq!(fingerprint(&bytes), fingerprint(&bytes.clone()));
        assert_eq!(fingerprint(&bytes).len(), 64);
        assert_ne!(fingerprint(&bytes), fingerprint(&bytes[1..]));
    }
}
