//! The `semi` driver. Runs a source file, or with `--emit`, stops after
//! an earlier compiler stage and prints it for diagnosis.
//!
//! run with `--help` for more info.

use semi::front::Lexer;
use semi::{SemiError, Vm, VmConfig};

use clap::{Parser, ValueEnum};

#[derive(Debug, Parser)]
#[command(version, about, long_about = None)]
struct Args {
    /// the input file
    file: String,
    /// stop after an earlier stage and print it instead of running
    #[arg(value_enum, short, long)]
    emit: Option<Emit>,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, ValueEnum)]
enum Emit {
    /// the lexer's token stream
    Tokens,
    /// the compiled chunk for the module's init function
    Chunk,
}

fn main() {
    tracing_subscriber::fmt::try_init().ok();

    let args = Args::parse();
    if let Err(err) = run(&args) {
        eprintln!("semi: {err}");
        std::process::exit(1);
    }
}

fn run(args: &Args) -> Result<(), SemiError> {
    let source = std::fs::read_to_string(&args.file).unwrap_or_else(|e| {
        eprintln!("semi: couldn't read {}: {e}", args.file);
        std::process::exit(1);
    });

    match args.emit {
        Some(Emit::Tokens) => emit_tokens(&source),
        Some(Emit::Chunk) => emit_chunk(&source),
        None => run_source(&source),
    }
}

fn emit_tokens(source: &str) -> Result<(), SemiError> {
    let mut lexer = Lexer::new(source.as_bytes())?;
    loop {
        let token = lexer.next_token()?;
        let is_eof = matches!(token.kind, semi::front::TokenKind::Eof);
        println!("{} {:?}", token.kind, token.pos);
        if is_eof {
            break;
        }
    }
    Ok(())
}

fn emit_chunk(source: &str) -> Result<(), SemiError> {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(source.as_bytes(), "main")?;
    let chunk = unsafe { &(*module.init).chunk };
    for (i, instr) in chunk.code.iter().enumerate() {
        println!("{i:04}  {instr:?}");
    }
    Ok(())
}

fn run_source(source: &str) -> Result<(), SemiError> {
    let mut vm = Vm::new(VmConfig::default());
    let module = vm.compile_module(source.as_bytes(), "main")?;
    let module_id = vm.register_module(module);
    vm.run_module(module_id)?;
    let result = vm.returned_value;
    if !matches!(result, semi::value::Value::Invalid) {
        println!("{result}");
    }
    Ok(())
}
