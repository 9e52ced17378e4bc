//! loxvm - a bytecode compiler and stack virtual machine for a small Lox dialect
//!
//! Source text is compiled in a single pass straight to bytecode, then
//! executed on a fixed-size value stack. Strings are interned, so equal
//! strings share one heap object.

pub mod token;
pub mod lexer;
pub mod value;
pub mod object;
pub mod table;
pub mod bytecode;
pub mod compiler;
pub mod error;
pub mod vm;

pub use bytecode::{Chunk, OpCode};
pub use compiler::compile;
pub use error::{CompileError, InterpretResult, RuntimeError};
pub use lexer::Lexer;
pub use object::{Handle, Heap};
pub use value::Value;
pub use vm::VM;

/// Compile and run `source` on a fresh VM printing to stdout
pub fn interpret(source: &str) -> InterpretResult {
    VM::new().interpret(source)
}

/// Version of loxvm
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
