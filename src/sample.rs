//! The sample module used by the CLI and the end-to-end tests.
//!
//! `SampleClassWithInstanceMethod.DoSomething` writes two lines through the
//! host console, one of them formatted with an argument.

use crate::il::{Instruction, MethodSig, Module, ModuleBuilder, Op, ReturnSig, TypeSig};
use crate::runtime::{Logger, LoggingInterceptor, Machine, RuntimeError, Value};
use std::sync::Arc;

pub const SAMPLE_TYPE: &str = "SampleClassWithInstanceMethod";
pub const SAMPLE_METHOD: &str = "DoSomething";
pub const CONSOLE_TYPE: &str = "Console";

/// Result handed back by [`sample_interceptor`] for every intercepted call.
pub const SAMPLE_RESULT: i32 = 1;

pub fn sample_module() -> Module {
    let mut builder = ModuleBuilder::new("SampleLibrary");

    let console = builder.add_type(CONSOLE_TYPE);
    let write_line = builder.add_native(
        console,
        "WriteLine",
        MethodSig::new_static(vec![TypeSig::String], ReturnSig::Void),
    );
    let write_line_fmt = builder.add_native(
        console,
        "WriteLineFormat",
        MethodSig::new_static(vec![TypeSig::String, TypeSig::String], ReturnSig::Void),
    );

    let sample = builder.add_type(SAMPLE_TYPE);
    builder.add_method(
        sample,
        SAMPLE_METHOD,
        MethodSig::new_instance(vec![], ReturnSig::Void),
        vec![],
        vec![
            Op::LdStr("Hello from DoSomething".to_string()).into(),
            Instruction::call(write_line),
            Op::LdStr("Hello, {0}".to_string()).into(),
            Op::LdStr("world".to_string()).into(),
            Instruction::call(write_line_fmt),
            Op::Ret.into(),
        ],
    );

    builder.finish()
}

/// Back `Console::WriteLine` and `Console::WriteLineFormat` with the
/// context's logger. Overloads the module does not declare are skipped.
pub fn register_console(machine: &mut Machine<'_>) -> Result<(), RuntimeError> {
    if machine.lookup(CONSOLE_TYPE, "WriteLine").is_ok() {
        machine.register_native(CONSOLE_TYPE, "WriteLine", |ctx, args| {
            let text = string_arg("Console::WriteLine", args, 0)?;
            ctx.logger().write_line(text);
            Ok(None)
        })?;
    }
    if machine.lookup(CONSOLE_TYPE, "WriteLineFormat").is_ok() {
        machine.register_native(CONSOLE_TYPE, "WriteLineFormat", |ctx, args| {
            let text = string_arg("Console::WriteLineFormat", args, 0)?;
            let arg = string_arg("Console::WriteLineFormat", args, 1)?;
            ctx.logger().write_line_with(text, arg);
            Ok(None)
        })?;
    }
    Ok(())
}

/// Logs each call and answers with a boxed [`SAMPLE_RESULT`].
///
/// Void callers discard the answer and int32 callers unbox it. Callees
/// returning other value types, strings or class instances fail the cast.
pub fn sample_interceptor(logger: Arc<dyn Logger>) -> LoggingInterceptor {
    LoggingInterceptor::new(logger).returning(Value::boxed(Value::I32(SAMPLE_RESULT)))
}

fn string_arg<'a>(method: &str, args: &'a [Value], index: usize) -> Result<&'a str, RuntimeError> {
    match args.get(index) {
        Some(Value::Str(s)) => Ok(&**s),
        Some(Value::Null) => Ok(""),
        other => Err(RuntimeError::Native {
            method: method.to_string(),
            message: format!("argument {} is not a string: {:?}", index, other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ExecutionContext, MemoryLogger, ObjectRef};

    #[test]
    fn test_sample_runs_unmodified() {
        let module = sample_module();
        let context = ExecutionContext::default();
        let logger = Arc::new(MemoryLogger::new());
        context.loggers.install(logger.clone());

        let mut machine = Machine::new(&module, context);
        register_console(&mut machine).unwrap();

        let ty = module.find_type(SAMPLE_TYPE).unwrap();
        let receiver = Value::Object(ObjectRef::new(ty));
        machine
            .invoke_named(SAMPLE_TYPE, SAMPLE_METHOD, vec![receiver])
            .unwrap();

        assert_eq!(
            logger.lines(),
            vec!["Hello from DoSomething", "Hello, world"]
        );
    }
}
