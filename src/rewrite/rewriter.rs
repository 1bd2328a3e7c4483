//! The call-site rewriting pass.
//!
//! A single linear walk over the original instruction stream. Non-call
//! instructions are copied as-is; every call is replaced by a fixed expansion:
//!
//! ```text
//! ; capture, last parameter first (stack pop order)
//! [box T(n-1)]  stloc p(n-1)
//! ...
//! [box T0]      stloc p0
//! [ldnull]      stloc recv           ; ldnull only for static callees
//! get.interceptor
//! ldc.i4 n      newarr object        stloc args
//! ldloc args    ldc.i4 j   ldloc pj  stelem.ref    ; j = 0..n, declared order
//! ldloc recv    ldloc args
//! ldtoken Type  ldtoken Method       resolve.method
//! intercept
//! pop | unbox.any R                  ; discard or coerce the result
//! ```

use crate::il::{
    Instruction, LocalDecl, LocalIndex, MetadataToken, MethodBody, MethodToken, Module, Op,
    TypeSig,
};

use super::error::RewriteError;
use super::locals::{LocalAllocator, SlotLimitReached};
use super::resolver::{Callee, ReturnDescriptor, SignatureResolver};

/// Slots staged for one call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSiteSlots {
    pub receiver: LocalIndex,
    /// One per declared parameter, in declared order.
    pub params: Vec<LocalIndex>,
    pub args_array: LocalIndex,
}

impl CallSiteSlots {
    pub fn all(&self) -> impl Iterator<Item = LocalIndex> + '_ {
        std::iter::once(self.receiver)
            .chain(self.params.iter().copied())
            .chain(std::iter::once(self.args_array))
    }
}

/// A rewritten call site.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallSite {
    /// Position of the call in the original instruction stream.
    pub position: usize,
    pub callee: MethodToken,
    pub slots: CallSiteSlots,
    /// Range of the expansion in the rewritten instruction stream.
    pub expansion: std::ops::Range<usize>,
}

/// Result of rewriting a body, not yet committed to it.
#[derive(Debug, Clone, PartialEq)]
pub struct RewrittenBody {
    pub instructions: Vec<Instruction>,
    pub new_locals: Vec<LocalDecl>,
    pub call_sites: Vec<CallSite>,
}

impl RewrittenBody {
    /// Replace the body's instructions and extend its locals.
    pub fn commit(self, body: &mut MethodBody) {
        body.instructions = self.instructions;
        body.locals.extend(self.new_locals);
    }
}

/// Build the rewritten form of `body` without touching it.
///
/// `method` names the body in errors.
pub(crate) fn rewrite_body(
    module: &Module,
    method: &str,
    body: &MethodBody,
    max_locals: u32,
) -> Result<RewrittenBody, RewriteError> {
    let resolver = SignatureResolver::new(module);
    let mut locals = LocalAllocator::new(body.locals.len(), max_locals);
    let mut out = Vec::with_capacity(body.instructions.len());
    let mut call_sites = Vec::new();

    for (position, instruction) in body.instructions.iter().enumerate() {
        if !instruction.is_call() {
            out.push(instruction.clone());
            continue;
        }

        let callee =
            resolver
                .describe(instruction)
                .map_err(|reason| RewriteError::SignatureResolution {
                    method: method.to_string(),
                    position,
                    reason: reason.to_string(),
                })?;

        let slots = allocate_slots(&callee, &mut locals).map_err(|limit| {
            RewriteError::ResourceExhausted {
                method: method.to_string(),
                limit: limit.limit,
            }
        })?;

        let start = out.len();
        expand_call_site(&callee, &slots, &mut out);
        log::debug!(
            "{}: call to {} at {} expanded to {} instructions",
            method,
            module.qualified_name(callee.method),
            position,
            out.len() - start
        );

        call_sites.push(CallSite {
            position,
            callee: callee.method,
            slots,
            expansion: start..out.len(),
        });
    }

    Ok(RewrittenBody {
        instructions: out,
        new_locals: locals.into_decls(),
        call_sites,
    })
}

fn allocate_slots(
    callee: &Callee,
    locals: &mut LocalAllocator,
) -> Result<CallSiteSlots, SlotLimitReached> {
    let receiver = locals.allocate(TypeSig::Object)?;
    let params = callee
        .params
        .iter()
        .map(|_| locals.allocate(TypeSig::Object))
        .collect::<Result<Vec<_>, _>>()?;
    let args_array = locals.allocate(TypeSig::ObjectArray)?;
    Ok(CallSiteSlots {
        receiver,
        params,
        args_array,
    })
}

fn expand_call_site(callee: &Callee, slots: &CallSiteSlots, out: &mut Vec<Instruction>) {
    let mut emit = |op: Op| out.push(Instruction::Other(op));

    // The last argument is on top of the stack.
    for (param, &slot) in callee.params.iter().zip(&slots.params).rev() {
        if param.ty.is_value_type() {
            emit(Op::Box(param.ty.clone()));
        }
        emit(Op::StLoc(slot));
    }

    if callee.is_static {
        emit(Op::LdNull);
    }
    emit(Op::StLoc(slots.receiver));

    emit(Op::GetInterceptor);

    emit(Op::LdcI4(callee.param_count() as i32));
    emit(Op::NewArr(TypeSig::Object));
    emit(Op::StLoc(slots.args_array));
    for (j, &slot) in slots.params.iter().enumerate() {
        emit(Op::LdLoc(slots.args_array));
        emit(Op::LdcI4(j as i32));
        emit(Op::LdLoc(slot));
        emit(Op::StElemRef);
    }

    emit(Op::LdLoc(slots.receiver));
    emit(Op::LdLoc(slots.args_array));
    emit(Op::LdToken(MetadataToken::Type(callee.declaring_type)));
    emit(Op::LdToken(MetadataToken::Method(callee.method)));
    emit(Op::ResolveMethod);
    emit(Op::Intercept);

    match &callee.ret {
        ReturnDescriptor::Void => emit(Op::Pop),
        ReturnDescriptor::Value { ty, .. } => emit(Op::UnboxAny(ty.clone())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{CallTarget, MethodSig, ModuleBuilder, ReturnSig};

    fn ops(instructions: &[Instruction]) -> Vec<Op> {
        instructions
            .iter()
            .map(|i| match i {
                Instruction::Other(op) => op.clone(),
                Instruction::Call(_) => panic!("call left in rewritten stream"),
            })
            .collect()
    }

    #[test]
    fn test_static_two_arg_expansion() {
        let mut builder = ModuleBuilder::new("m");
        let math = builder.add_type("Math");
        let max = builder.add_native(
            math,
            "Max",
            MethodSig::new_static(
                vec![TypeSig::I32, TypeSig::String],
                ReturnSig::Type(TypeSig::I32),
            ),
        );
        let module = builder.finish();

        let body = MethodBody::new(
            vec![LocalDecl { ty: TypeSig::I32 }],
            vec![
                Op::LdcI4(7).into(),
                Op::LdStr("x".into()).into(),
                Instruction::call(max),
                Op::Ret.into(),
            ],
        );

        let rewritten = rewrite_body(&module, "Caller", &body, 1000).unwrap();
        let (recv, p0, p1, args) = (LocalIndex(1), LocalIndex(2), LocalIndex(3), LocalIndex(4));

        assert_eq!(
            ops(&rewritten.instructions),
            vec![
                Op::LdcI4(7),
                Op::LdStr("x".into()),
                // capture
                Op::StLoc(p1),
                Op::Box(TypeSig::I32),
                Op::StLoc(p0),
                Op::LdNull,
                Op::StLoc(recv),
                Op::GetInterceptor,
                // argument array
                Op::LdcI4(2),
                Op::NewArr(TypeSig::Object),
                Op::StLoc(args),
                Op::LdLoc(args),
                Op::LdcI4(0),
                Op::LdLoc(p0),
                Op::StElemRef,
                Op::LdLoc(args),
                Op::LdcI4(1),
                Op::LdLoc(p1),
                Op::StElemRef,
                // dispatch
                Op::LdLoc(recv),
                Op::LdLoc(args),
                Op::LdToken(MetadataToken::Type(math)),
                Op::LdToken(MetadataToken::Method(max)),
                Op::ResolveMethod,
                Op::Intercept,
                Op::UnboxAny(TypeSig::I32),
                Op::Ret,
            ]
        );
        assert_eq!(rewritten.new_locals.len(), 4);
        assert_eq!(rewritten.new_locals[3].ty, TypeSig::ObjectArray);
        assert_eq!(rewritten.call_sites.len(), 1);
        assert_eq!(rewritten.call_sites[0].position, 2);
        assert_eq!(rewritten.call_sites[0].expansion, 2..26);
    }

    #[test]
    fn test_instance_void_expansion() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Widget");
        let touch =
            builder.add_native(ty, "Touch", MethodSig::new_instance(vec![], ReturnSig::Void));
        let module = builder.finish();

        let body = MethodBody::new(vec![], vec![Op::LdArg(0).into(), Instruction::call(touch)]);
        let rewritten = rewrite_body(&module, "Caller", &body, 1000).unwrap();
        let ops = ops(&rewritten.instructions);

        // The receiver pushed by ldarg.0 is stored directly, no ldnull.
        assert_eq!(ops[1], Op::StLoc(LocalIndex(0)));
        assert_eq!(ops[2], Op::GetInterceptor);
        assert_eq!(ops[3], Op::LdcI4(0));
        assert_eq!(ops.last(), Some(&Op::Pop));
        assert!(!ops.contains(&Op::LdNull));
        assert!(!ops.contains(&Op::StElemRef));
    }

    #[test]
    fn test_indirect_call_fails_without_output() {
        let module = ModuleBuilder::new("m").finish();
        let body = MethodBody::new(
            vec![],
            vec![Op::Nop.into(), Instruction::Call(CallTarget::Indirect { arity: 0 })],
        );
        let err = rewrite_body(&module, "Caller", &body, 1000).unwrap_err();
        assert!(matches!(
            err,
            RewriteError::SignatureResolution { position: 1, .. }
        ));
    }

    #[test]
    fn test_slot_limit() {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("T");
        let f = builder.add_native(
            ty,
            "F",
            MethodSig::new_static(vec![TypeSig::Object], ReturnSig::Void),
        );
        let module = builder.finish();

        let body = MethodBody::new(vec![], vec![Op::LdNull.into(), Instruction::call(f)]);
        let err = rewrite_body(&module, "Caller", &body, 2).unwrap_err();
        assert!(matches!(err, RewriteError::ResourceExhausted { limit: 2, .. }));
    }
}
