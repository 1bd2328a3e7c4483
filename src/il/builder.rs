//! Incremental module construction.

use super::{
    Instruction, LocalDecl, MethodBody, MethodDef, MethodSig, MethodToken, Module, TypeDef,
    TypeToken,
};

/// Builder for [`Module`]s.
///
/// Tokens are handed out in insertion order, so a method can be referenced by
/// bodies added after it (or by its own body, via [`ModuleBuilder::reserve`]).
pub struct ModuleBuilder {
    module: Module,
}

impl ModuleBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            module: Module::new(name),
        }
    }

    pub fn add_type(&mut self, name: &str) -> TypeToken {
        let token = TypeToken(self.module.types.len() as u32);
        self.module.types.push(TypeDef {
            name: name.to_string(),
            methods: Vec::new(),
        });
        token
    }

    /// Declare a method with a body.
    pub fn add_method(
        &mut self,
        ty: TypeToken,
        name: &str,
        signature: MethodSig,
        locals: Vec<LocalDecl>,
        instructions: Vec<Instruction>,
    ) -> MethodToken {
        self.push_method(ty, name, signature, Some(MethodBody::new(locals, instructions)))
    }

    /// Declare a method the host implements natively.
    pub fn add_native(&mut self, ty: TypeToken, name: &str, signature: MethodSig) -> MethodToken {
        self.push_method(ty, name, signature, None)
    }

    /// Declare a method whose body is supplied later with [`ModuleBuilder::set_body`].
    pub fn reserve(&mut self, ty: TypeToken, name: &str, signature: MethodSig) -> MethodToken {
        self.push_method(ty, name, signature, None)
    }

    pub fn set_body(
        &mut self,
        method: MethodToken,
        locals: Vec<LocalDecl>,
        instructions: Vec<Instruction>,
    ) {
        if let Some(def) = self.module.method_mut(method) {
            def.body = Some(MethodBody::new(locals, instructions));
        }
    }

    pub fn finish(self) -> Module {
        self.module
    }

    fn push_method(
        &mut self,
        ty: TypeToken,
        name: &str,
        signature: MethodSig,
        body: Option<MethodBody>,
    ) -> MethodToken {
        let token = MethodToken(self.module.methods.len() as u32);
        self.module.methods.push(MethodDef {
            declaring_type: ty,
            name: name.to_string(),
            signature,
            body,
        });
        if let Some(def) = self.module.types.get_mut(ty.0 as usize) {
            def.methods.push(token);
        }
        token
    }
}
