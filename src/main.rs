//! loxvm CLI and REPL
//!
//! Usage:
//!   loxvm                 - Start interactive REPL
//!   loxvm <file.lox>      - Execute a file
//!   loxvm --print-code    - Also dump the bytecode of each chunk

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::ExitCode;

use clap::Parser;
use colored::Colorize;
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use tracing_subscriber::EnvFilter;

use loxvm::{compile, InterpretResult, VERSION, VM};

// sysexits.h
const EX_DATAERR: u8 = 65;
const EX_SOFTWARE: u8 = 70;
const EX_IOERR: u8 = 74;

#[derive(Debug, Parser)]
#[command(name = "loxvm", version, about = "Bytecode VM for a small Lox dialect")]
struct Cli {
    /// Script to run; starts the REPL when omitted
    path: Option<PathBuf>,

    /// Print the disassembled bytecode before running it
    #[arg(long)]
    print_code: bool,

    /// Log filter, e.g. `debug` or `loxvm=trace` (defaults to RUST_LOG)
    #[arg(long)]
    log: Option<String>,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_logging(cli.log.as_deref());

    match &cli.path {
        Some(path) => run_file(path, cli.print_code),
        None => {
            run_repl(cli.print_code);
            ExitCode::SUCCESS
        }
    }
}

fn init_logging(filter: Option<&str>) {
    let filter = match filter {
        Some(directives) => EnvFilter::new(directives),
        None => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Compile and run one unit of source, optionally dumping its bytecode
fn execute<W: Write>(vm: &mut VM<W>, source: &str, print_code: bool) -> InterpretResult {
    if !print_code {
        return vm.interpret(source);
    }

    let chunk = match compile(source, &mut vm.heap) {
        Ok(chunk) => chunk,
        Err(err) => {
            eprintln!("{}", err);
            return InterpretResult::CompileError;
        }
    };
    eprint!("{}", chunk.disassemble("code", &vm.heap));

    match vm.run(chunk) {
        Ok(()) => InterpretResult::Ok,
        Err(err) => {
            eprintln!("{}", err);
            InterpretResult::RuntimeError
        }
    }
}

fn run_file(path: &Path, print_code: bool) -> ExitCode {
    let source = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) => {
            eprintln!("{}: cannot read file '{}': {}", "error".red(), path.display(), e);
            return ExitCode::from(EX_IOERR);
        }
    };

    let mut vm = VM::new();
    match execute(&mut vm, &source, print_code) {
        InterpretResult::Ok => ExitCode::SUCCESS,
        InterpretResult::CompileError => ExitCode::from(EX_DATAERR),
        InterpretResult::RuntimeError => ExitCode::from(EX_SOFTWARE),
    }
}

fn run_repl(print_code: bool) {
    println!(
        "{} {} - {}",
        "loxvm".cyan().bold(),
        VERSION.cyan(),
        "bytecode VM".dimmed()
    );
    println!("Type {} to exit\n", "exit".yellow());

    let mut rl = match DefaultEditor::new() {
        Ok(rl) => rl,
        Err(err) => {
            eprintln!("{}: cannot start REPL: {}", "error".red(), err);
            return;
        }
    };

    // Globals and interned strings persist across lines
    let mut vm = VM::new();

    loop {
        match rl.readline(&format!("{} ", ">".green().bold())) {
            Ok(line) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }

                let _ = rl.add_history_entry(line);

                if matches!(line, "exit" | "quit") {
                    break;
                }

                execute(&mut vm, line, print_code);
            }
            Err(ReadlineError::Interrupted) => {
                println!("{}", "^C".dimmed());
            }
            Err(ReadlineError::Eof) => break,
            Err(err) => {
                eprintln!("{}: {:?}", "error".red(), err);
                break;
            }
        }
    }
}
