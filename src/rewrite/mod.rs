//! Call-Site Interception
//!
//! Rewrites method bodies so that every call is routed through the installed
//! [`Interceptor`](crate::runtime::Interceptor) instead of reaching its callee.
//!
//! # Example
//!
//! ```ignore
//! use callweave::rewrite::{CallSiteRewriter, RewriteOutcome};
//!
//! let mut module = callweave::il::decode(&std::fs::read("app.cwil")?)?;
//! match CallSiteRewriter::new().rewrite_named(&mut module, "Program", "Main")? {
//!     RewriteOutcome::Rewritten(report) => println!("{} call sites", report.call_sites),
//!     RewriteOutcome::NotFound(missing) => println!("nothing to do: {}", missing),
//! }
//! std::fs::write("app.cwil", callweave::il::encode(&module))?;
//! ```
//!
//! # How It Works
//!
//! 1. **Resolve** each call's callee signature from module metadata
//! 2. **Allocate** fresh locals: receiver, one per parameter, argument array
//! 3. **Expand** the call into capture, dispatch and coerce instructions
//! 4. **Commit** the new stream and locals only once the whole body succeeded
//!
//! Rewritten code no longer contains the original calls, so a body must be
//! rewritten exactly once.

mod error;
mod locals;
mod resolver;
mod rewriter;

pub use error::RewriteError;
pub use locals::{LocalAllocator, SlotLimitReached};
pub use resolver::{Callee, ParamDescriptor, ReturnDescriptor, SignatureResolver, Unresolvable};
pub use rewriter::{CallSite, CallSiteSlots, RewrittenBody};

use std::fmt;

use crate::il::{MethodBody, MethodToken, Module, MAX_LOCALS};

/// Default local-slot ceiling per method body.
pub const DEFAULT_MAX_LOCALS: u32 = 65_534;

#[derive(Debug, Clone, Copy)]
pub struct RewriteOptions {
    /// Highest number of locals a body may declare after rewriting. Values
    /// above [`MAX_LOCALS`] are lowered to it.
    pub max_locals: u32,
}

impl Default for RewriteOptions {
    fn default() -> Self {
        Self {
            max_locals: DEFAULT_MAX_LOCALS,
        }
    }
}

/// Summary of one rewritten method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteReport {
    pub method: MethodToken,
    pub call_sites: usize,
    pub locals_added: usize,
    pub instructions_before: usize,
    pub instructions_after: usize,
}

/// What [`CallSiteRewriter::rewrite_named`] could not find.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Missing {
    Type(String),
    Method { type_name: String, method: String },
    Body { type_name: String, method: String },
}

impl fmt::Display for Missing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Missing::Type(name) => write!(f, "type '{}' not found", name),
            Missing::Method { type_name, method } => {
                write!(f, "method '{}' not found on '{}'", method, type_name)
            }
            Missing::Body { type_name, method } => {
                write!(f, "method '{}::{}' has no body", type_name, method)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteOutcome {
    Rewritten(RewriteReport),
    /// Nothing was changed.
    NotFound(Missing),
}

/// Rewrites call sites of method bodies.
#[derive(Debug, Clone, Default)]
pub struct CallSiteRewriter {
    options: RewriteOptions,
}

impl CallSiteRewriter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: RewriteOptions) -> Self {
        Self {
            options: RewriteOptions {
                max_locals: options.max_locals.min(MAX_LOCALS),
            },
        }
    }

    pub fn options(&self) -> &RewriteOptions {
        &self.options
    }

    /// Build the rewritten form of a body without modifying it.
    ///
    /// `body` does not have to belong to `module`; only its call targets are
    /// looked up there.
    pub fn rewrite_body(
        &self,
        module: &Module,
        method: &str,
        body: &MethodBody,
    ) -> Result<RewrittenBody, RewriteError> {
        rewriter::rewrite_body(module, method, body, self.options.max_locals)
    }

    /// Rewrite one method of `module` in place.
    ///
    /// # Errors
    ///
    /// Returns `RewriteError::SignatureResolution` or
    /// `RewriteError::ResourceExhausted` without modifying the module.
    pub fn rewrite_method(
        &self,
        module: &mut Module,
        method: MethodToken,
    ) -> Result<RewriteReport, RewriteError> {
        let (rewritten, report) = self.prepare(module, method)?;
        self.commit(module, method, rewritten);
        Ok(report)
    }

    /// Rewrite `type_name::method_name`, or report what is missing.
    ///
    /// A missing type, method or body is not an error: the module is left
    /// untouched and [`RewriteOutcome::NotFound`] is returned.
    pub fn rewrite_named(
        &self,
        module: &mut Module,
        type_name: &str,
        method_name: &str,
    ) -> Result<RewriteOutcome, RewriteError> {
        let Some(ty) = module.find_type(type_name) else {
            log::warn!("type '{}' not found in module '{}'", type_name, module.name);
            return Ok(RewriteOutcome::NotFound(Missing::Type(type_name.to_string())));
        };

        let Some(method) = module.find_method(ty, method_name) else {
            log::warn!("method '{}::{}' not found", type_name, method_name);
            return Ok(RewriteOutcome::NotFound(Missing::Method {
                type_name: type_name.to_string(),
                method: method_name.to_string(),
            }));
        };

        if module.method(method).is_some_and(|m| m.body.is_none()) {
            log::warn!("method '{}::{}' has no body", type_name, method_name);
            return Ok(RewriteOutcome::NotFound(Missing::Body {
                type_name: type_name.to_string(),
                method: method_name.to_string(),
            }));
        }

        self.rewrite_method(module, method)
            .map(RewriteOutcome::Rewritten)
    }

    /// Rewrite several methods. Either all of them are rewritten or, on the
    /// first error, none is.
    pub fn rewrite_methods(
        &self,
        module: &mut Module,
        methods: impl IntoIterator<Item = MethodToken>,
    ) -> Result<Vec<RewriteReport>, RewriteError> {
        let mut staged = Vec::new();
        for method in methods {
            if staged.iter().any(|(m, _, _)| *m == method) {
                continue;
            }
            let (rewritten, report) = self.prepare(module, method)?;
            staged.push((method, rewritten, report));
        }

        let mut reports = Vec::with_capacity(staged.len());
        for (method, rewritten, report) in staged {
            self.commit(module, method, rewritten);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Rewrite every method that has a body.
    pub fn rewrite_all(&self, module: &mut Module) -> Result<Vec<RewriteReport>, RewriteError> {
        let methods: Vec<MethodToken> = module
            .methods
            .iter()
            .enumerate()
            .filter(|(_, m)| m.body.is_some())
            .map(|(idx, _)| MethodToken(idx as u32))
            .collect();
        self.rewrite_methods(module, methods)
    }

    fn prepare(
        &self,
        module: &Module,
        method: MethodToken,
    ) -> Result<(RewrittenBody, RewriteReport), RewriteError> {
        let name = module.qualified_name(method);
        let def = module
            .method(method)
            .ok_or_else(|| RewriteError::MethodNotFound(name.clone()))?;
        let body = def
            .body
            .as_ref()
            .ok_or_else(|| RewriteError::NoBody(name.clone()))?;

        let rewritten = self.rewrite_body(module, &name, body)?;
        let report = RewriteReport {
            method,
            call_sites: rewritten.call_sites.len(),
            locals_added: rewritten.new_locals.len(),
            instructions_before: body.instructions.len(),
            instructions_after: rewritten.instructions.len(),
        };
        Ok((rewritten, report))
    }

    fn commit(&self, module: &mut Module, method: MethodToken, rewritten: RewrittenBody) {
        let name = module.qualified_name(method);
        if let Some(body) = module.method_mut(method).and_then(|m| m.body.as_mut()) {
            log::info!(
                "rewrote {}: {} call sites, {} -> {} instructions, {} locals added",
                name,
                rewritten.call_sites.len(),
                body.instructions.len(),
                rewritten.instructions.len(),
                rewritten.new_locals.len()
            );
            rewritten.commit(body);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::il::{Instruction, MethodSig, ModuleBuilder, Op, ReturnSig, TypeSig};

    fn module_with_two_callers() -> (Module, MethodToken, MethodToken) {
        let mut builder = ModuleBuilder::new("m");
        let ty = builder.add_type("Program");
        let print = builder.add_native(
            ty,
            "Print",
            MethodSig::new_static(vec![TypeSig::String], ReturnSig::Void),
        );
        let good = builder.add_method(
            ty,
            "Good",
            MethodSig::new_static(vec![], ReturnSig::Void),
            vec![],
            vec![
                Op::LdStr("hi".into()).into(),
                Instruction::call(print),
                Op::Ret.into(),
            ],
        );
        let bad = builder.add_method(
            ty,
            "Bad",
            MethodSig::new_static(vec![], ReturnSig::Void),
            vec![],
            vec![
                Op::LdFtn(print).into(),
                Instruction::Call(crate::il::CallTarget::Indirect { arity: 0 }),
                Op::Ret.into(),
            ],
        );
        (builder.finish(), good, bad)
    }

    #[test]
    fn test_rewrite_named_not_found() {
        let (mut module, _, _) = module_with_two_callers();
        let before = module.clone();
        let rewriter = CallSiteRewriter::new();

        assert_eq!(
            rewriter.rewrite_named(&mut module, "Nope", "Good").unwrap(),
            RewriteOutcome::NotFound(Missing::Type("Nope".into()))
        );
        assert!(matches!(
            rewriter.rewrite_named(&mut module, "Program", "Nope").unwrap(),
            RewriteOutcome::NotFound(Missing::Method { .. })
        ));
        assert!(matches!(
            rewriter.rewrite_named(&mut module, "Program", "Print").unwrap(),
            RewriteOutcome::NotFound(Missing::Body { .. })
        ));
        assert_eq!(module, before);
    }

    #[test]
    fn test_rewrite_named_reports() {
        let (mut module, good, _) = module_with_two_callers();
        let outcome = CallSiteRewriter::new()
            .rewrite_named(&mut module, "Program", "Good")
            .unwrap();

        let RewriteOutcome::Rewritten(report) = outcome else {
            panic!("expected a rewrite");
        };
        assert_eq!(report.method, good);
        assert_eq!(report.call_sites, 1);
        assert_eq!(report.locals_added, 3);
        assert_eq!(report.instructions_before, 3);
        let body = module.method(good).unwrap().body.as_ref().unwrap();
        assert_eq!(body.locals.len(), 3);
        assert_eq!(body.instructions.len(), report.instructions_after);
        assert_eq!(body.call_sites(), 0);
    }

    #[test]
    fn test_batch_is_all_or_nothing() {
        let (mut module, good, bad) = module_with_two_callers();
        let before = module.clone();

        let err = CallSiteRewriter::new()
            .rewrite_methods(&mut module, [good, bad])
            .unwrap_err();
        assert!(matches!(err, RewriteError::SignatureResolution { .. }));
        assert_eq!(module, before);
    }

    #[test]
    fn test_rewrite_method_errors() {
        let (mut module, _, _) = module_with_two_callers();
        let rewriter = CallSiteRewriter::new();
        assert!(matches!(
            rewriter.rewrite_method(&mut module, MethodToken(42)),
            Err(RewriteError::MethodNotFound(_))
        ));
        assert!(matches!(
            rewriter.rewrite_method(&mut module, MethodToken(0)),
            Err(RewriteError::NoBody(_))
        ));
    }
}
