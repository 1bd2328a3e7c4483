//! Callweave CLI - tools for working with CWIL modules
//!
//! Commands:
//!   callweave inspect <module>                       - Disassemble a module
//!   callweave rewrite <module> --type T --method M   - Intercept the calls of T::M
//!   callweave run <module> --type T --method M       - Execute T::M
//!   callweave sample -o <module>                     - Write the sample module

use anyhow::Context;
use callweave::il::{fingerprint, CallTarget, Instruction, MethodDef, MethodSig, Module};
use callweave::rewrite::{CallSiteRewriter, RewriteOutcome};
use callweave::runtime::{ExecutionContext, LogLogger, Machine, ObjectRef};
use callweave::{decode, encode, sample, Value};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;

#[derive(Parser)]
#[command(name = "callweave")]
#[command(about = "Redirect method calls through an interceptor", long_about = None)]
struct Cli {
    /// Enable debug logging
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Disassemble a module
    Inspect {
        /// Path to the module file
        module: PathBuf,

        /// Output as JSON
        #[arg(long)]
        json: bool,
    },

    /// Rewrite the call sites of one method
    Rewrite {
        /// Path to the module file
        module: PathBuf,

        /// Declaring type of the method to rewrite
        #[arg(long = "type")]
        type_name: String,

        /// Name of the method to rewrite
        #[arg(long)]
        method: String,

        /// Where to write the result (defaults to the input file)
        #[arg(long, short)]
        output: Option<PathBuf>,
    },

    /// Execute a parameterless method
    ///
    /// With --rewrite, every call site is logged and answered with a boxed
    /// int32 1, which only void, int32 and object callees accept.
    Run {
        /// Path to the module file
        module: PathBuf,

        #[arg(long = "type")]
        type_name: String,

        #[arg(long)]
        method: String,

        /// Rewrite the method in memory before running it
        #[arg(long)]
        rewrite: bool,
    },

    /// Write the sample module
    Sample {
        #[arg(long, short)]
        output: PathBuf,
    },
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(level)).init();

    match cli.command {
        Commands::Inspect { module, json } => inspect_command(&module, json),
        Commands::Rewrite {
            module,
            type_name,
            method,
            output,
        } => rewrite_command(&module, &type_name, &method, output.as_deref()),
        Commands::Run {
            module,
            type_name,
            method,
            rewrite,
        } => run_command(&module, &type_name, &method, rewrite),
        Commands::Sample { output } => sample_command(&output),
    }
}

fn load(path: &Path) -> anyhow::Result<(Module, Vec<u8>)> {
    let bytes =
        std::fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let module = decode(&bytes).with_context(|| format!("Failed to decode {}", path.display()))?;
    Ok((module, bytes))
}

fn inspect_command(path: &Path, json: bool) -> anyhow::Result<()> {
    let (module, bytes) = load(path)?;

    if json {
        let doc = serde_json::json!({
            "fingerprint": fingerprint(&bytes),
            "module": module,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    println!("module {} ({})", module.name, fingerprint(&bytes));
    for ty in &module.types {
        println!("type {}", ty.name);
        for &token in &ty.methods {
            if let Some(method) = module.method(token) {
                print_method(&module, method);
            }
        }
    }
    Ok(())
}

fn print_method(module: &Module, method: &MethodDef) {
    println!("  {}{}", method.name, format_signature(&method.signature));
    let Some(body) = &method.body else {
        println!("    native");
        return;
    };
    for (idx, local) in body.locals.iter().enumerate() {
        println!("    .local {} {}", idx, local.ty);
    }
    for (pos, instr) in body.instructions.iter().enumerate() {
        match instr {
            Instruction::Call(CallTarget::Direct(token)) => {
                println!("    {:04}  call {}", pos, module.qualified_name(*token))
            }
            other => println!("    {:04}  {}", pos, other),
        }
    }
}

fn format_signature(sig: &MethodSig) -> String {
    let params: Vec<String> = sig.params.iter().map(|p| p.to_string()).collect();
    format!(
        "({}) -> {}{}",
        params.join(", "),
        sig.ret,
        if sig.is_static { " static" } else { "" }
    )
}

fn rewrite_command(
    path: &Path,
    type_name: &str,
    method: &str,
    output: Option<&Path>,
) -> anyhow::Result<()> {
    let (mut module, bytes) = load(path)?;
    let rewriter = CallSiteRewriter::new();

    match rewriter.rewrite_named(&mut module, type_name, method)? {
        RewriteOutcome::NotFound(missing) => {
            println!("nothing rewritten: {}", missing);
            Ok(())
        }
        RewriteOutcome::Rewritten(report) => {
            let encoded = encode(&module);
            let target = output.unwrap_or(path);
            std::fs::write(target, &encoded)
                .with_context(|| format!("Failed to write {}", target.display()))?;

            println!("rewrote {}", module.qualified_name(report.method));
            println!("  call sites:   {}", report.call_sites);
            println!("  locals added: {}", report.locals_added);
            println!(
                "  instructions: {} -> {}",
                report.instructions_before, report.instructions_after
            );
            println!("  before: {}", fingerprint(&bytes));
            println!("  after:  {}", fingerprint(&encoded));
            Ok(())
        }
    }
}

fn run_command(path: &Path, type_name: &str, method: &str, rewrite: bool) -> anyhow::Result<()> {
    let (mut module, _) = load(path)?;

    if rewrite {
        if let RewriteOutcome::NotFound(missing) =
            CallSiteRewriter::new().rewrite_named(&mut module, type_name, method)?
        {
            anyhow::bail!("Cannot rewrite: {}", missing);
        }
    }

    let interceptor = sample::sample_interceptor(Arc::new(LogLogger));
    let context = ExecutionContext::with_interceptor(Arc::new(interceptor));
    let mut machine = Machine::new(&module, context);
    sample::register_console(&mut machine)?;

    let token = machine.lookup(type_name, method)?;
    let def = module
        .method(token)
        .ok_or_else(|| anyhow::anyhow!("Method {}::{} not found", type_name, method))?;

    let mut args = Vec::new();
    if !def.signature.is_static {
        args.push(Value::Object(ObjectRef::new(def.declaring_type)));
    }
    if !def.signature.params.is_empty() {
        anyhow::bail!(
            "{}::{} takes parameters; only parameterless methods can be run",
            type_name,
            method
        );
    }

    match machine.invoke(token, args)? {
        Some(value) => println!("returned {}", value),
        None => println!("returned"),
    }
    Ok(())
}

fn sample_command(output: &Path) -> anyhow::Result<()> {
    let module = sample::sample_module();
    let bytes = encode(&module);
    std::fs::write(output, &bytes)
        .with_context(|| format!("Failed to write {}", output.display()))?;
    println!("wrote {} ({})", output.display(), fingerprint(&bytes));
    Ok(())
}
