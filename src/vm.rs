//! Stack-based virtual machine
//!
//! Runs one chunk at a time over a fixed-capacity value stack. The heap,
//! its intern set and the global variables outlive individual runs, so a
//! REPL can feed one VM line after line.

use std::io::{self, Write};

use tracing::{debug, trace};

use crate::bytecode::{Chunk, OpCode};
use crate::compiler;
use crate::error::{InterpretResult, Result, RuntimeError, RuntimeErrorKind};
use crate::object::Heap;
use crate::table::{fnv1a, Table};
use crate::value::Value;

/// Maximum stack size
pub const STACK_MAX: usize = 256;

/// The Virtual Machine
pub struct VM<W: Write = io::Stdout> {
    /// Chunk being executed
    chunk: Chunk,

    /// Offset of the next byte to read
    ip: usize,

    /// Value stack
    stack: Vec<Value>,

    /// Global variables, keyed by interned name
    globals: Table,

    /// Owner of every object, including the intern set
    pub heap: Heap,

    /// Where `print` writes
    out: W,
}

impl VM<io::Stdout> {
    pub fn new() -> Self {
        Self::with_output(io::stdout())
    }
}

impl Default for VM<io::Stdout> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W: Write> VM<W> {
    pub fn with_output(out: W) -> Self {
        Self {
            chunk: Chunk::new(),
            ip: 0,
            stack: Vec::with_capacity(STACK_MAX),
            globals: Table::new(),
            heap: Heap::new(),
            out,
        }
    }

    pub fn output(&self) -> &W {
        &self.out
    }

    pub fn into_output(self) -> W {
        self.out
    }

    /// Compile and run `source`. Diagnostics and runtime errors are written
    /// to stderr.
    pub fn interpret(&mut self, source: &str) -> InterpretResult {
        let chunk = match compiler::compile(source, &mut self.heap) {
            Ok(chunk) => chunk,
            Err(err) => {
                eprintln!("{}", err);
                return InterpretResult::CompileError;
            }
        };

        match self.run(chunk) {
            Ok(()) => InterpretResult::Ok,
            Err(err) => {
                eprintln!("{}", err);
                InterpretResult::RuntimeError
            }
        }
    }

    /// Run a compiled chunk to its `Return`. The stack is reset first and
    /// after a runtime error.
    pub fn run(&mut self, chunk: Chunk) -> Result<()> {
        self.chunk = chunk;
        self.ip = 0;
        self.stack.clear();

        let result = self.execute();
        if let Err(err) = &result {
            debug!(line = err.line, error = %err.kind, "runtime error");
            self.stack.clear();
        }
        result
    }

    /// Value of a global variable, if defined. A name never interned
    /// cannot be a global, so a miss allocates nothing.
    pub fn global(&self, name: &str) -> Option<Value> {
        let handle = self.heap.find_interned(name, fnv1a(name.as_bytes()))?;
        let key = self.heap.key(Value::Obj(handle));
        self.globals.get(&key)
    }

    pub fn stack_len(&self) -> usize {
        self.stack.len()
    }

    pub fn chunk(&self) -> &Chunk {
        &self.chunk
    }

    fn execute(&mut self) -> Result<()> {
        loop {
            let offset = self.ip;
            let byte = self.read_byte()?;
            let opcode = OpCode::try_from(byte)
                .map_err(|byte| self.error_at(offset, RuntimeErrorKind::UnknownOpcode(byte)))?;

            trace!(offset, op = ?opcode, depth = self.stack.len(), "execute");

            match opcode {
                OpCode::Constant => {
                    let value = self.read_constant()?;
                    self.push(value)?;
                }

                OpCode::Nil => self.push(Value::Nil)?,
                OpCode::True => self.push(Value::Bool(true))?,
                OpCode::False => self.push(Value::Bool(false))?,

                OpCode::Pop => {
                    self.pop()?;
                }

                OpCode::GetGlobal => {
                    let name = self.read_constant()?;
                    let key = self.heap.key(name);
                    match self.globals.get(&key) {
                        Some(value) => self.push(value)?,
                        None => return Err(self.undefined_variable(name)),
                    }
                }

                OpCode::DefineGlobal => {
                    let name = self.read_constant()?;
                    let key = self.heap.key(name);
                    let value = self.peek(0)?;
                    self.globals.set(key, value);
                    self.pop()?;
                }

                OpCode::SetGlobal => {
                    let name = self.read_constant()?;
                    let key = self.heap.key(name);
                    let value = self.peek(0)?;
                    // Assignment never creates a variable
                    if self.globals.set(key, value) {
                        self.globals.delete(&key);
                        return Err(self.undefined_variable(name));
                    }
                }

                OpCode::Equal => {
                    let b = self.pop()?;
                    let a = self.pop()?;
                    self.push(Value::Bool(a == b))?;
                }

                OpCode::Greater => self.comparison_op(|a, b| a > b)?,
                OpCode::Less => self.comparison_op(|a, b| a < b)?,

                OpCode::Add => self.add()?,
                OpCode::Subtract => self.binary_op(|a, b| a - b)?,
                OpCode::Multiply => self.binary_op(|a, b| a * b)?,
                OpCode::Divide => self.binary_op(|a, b| a / b)?,

                OpCode::Not => {
                    let value = self.pop()?;
                    self.push(Value::Bool(value.is_falsey()))?;
                }

                OpCode::Negate => match self.peek(0)? {
                    Value::Number(n) => {
                        self.pop()?;
                        self.push(Value::Number(-n))?;
                    }
                    _ => return Err(self.error(RuntimeErrorKind::OperandMustBeNumber)),
                },

                OpCode::Print => {
                    let value = self.pop()?;
                    let text = self.heap.display(value);
                    writeln!(self.out, "{}", text)
                        .map_err(|e| self.error(RuntimeErrorKind::Io(e.to_string())))?;
                }

                OpCode::Jump => {
                    let jump = self.read_u16()?;
                    self.ip += jump as usize;
                }

                OpCode::JumpIfFalse => {
                    let jump = self.read_u16()?;
                    if self.peek(0)?.is_falsey() {
                        self.ip += jump as usize;
                    }
                }

                OpCode::Return => {
                    self.out
                        .flush()
                        .map_err(|e| self.error(RuntimeErrorKind::Io(e.to_string())))?;
                    return Ok(());
                }
            }
        }
    }

    /// `+` adds numbers and concatenates strings
    fn add(&mut self) -> Result<()> {
        let b = self.peek(0)?;
        let a = self.peek(1)?;

        match (a, b) {
            (Value::Number(x), Value::Number(y)) => {
                self.pop()?;
                self.pop()?;
                self.push(Value::Number(x + y))
            }
            (Value::Obj(x), Value::Obj(y)) => {
                let (Some(left), Some(right)) = (self.heap.get_string(x), self.heap.get_string(y))
                else {
                    return Err(self.error(RuntimeErrorKind::OperandsMustBeNumbersOrStrings));
                };

                let mut joined = String::with_capacity(left.len() + right.len());
                joined.push_str(left.as_str());
                joined.push_str(right.as_str());
                let handle = self.heap.take_string(joined);

                self.pop()?;
                self.pop()?;
                self.push(Value::Obj(handle))
            }
            _ => Err(self.error(RuntimeErrorKind::OperandsMustBeNumbersOrStrings)),
        }
    }

    fn binary_op<F>(&mut self, op: F) -> Result<()>
    where
        F: Fn(f64, f64) -> f64,
    {
        let (a, b) = self.number_operands()?;
        self.push(Value::Number(op(a, b)))
    }

    fn comparison_op<F>(&mut self, op: F) -> Result<()>
    where
        F: Fn(f64, f64) -> bool,
    {
        let (a, b) = self.number_operands()?;
        self.push(Value::Bool(op(a, b)))
    }

    /// Pop right then left, both of which must be numbers
    fn number_operands(&mut self) -> Result<(f64, f64)> {
        match (self.peek(1)?, self.peek(0)?) {
            (Value::Number(a), Value::Number(b)) => {
                self.pop()?;
                self.pop()?;
                Ok((a, b))
            }
            _ => Err(self.error(RuntimeErrorKind::OperandsMustBeNumbers)),
        }
    }

    // ==================== Helpers ====================

    fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= STACK_MAX {
            return Err(self.error(RuntimeErrorKind::StackOverflow));
        }
        self.stack.push(value);
        Ok(())
    }

    fn pop(&mut self) -> Result<Value> {
        match self.stack.pop() {
            Some(value) => Ok(value),
            None => Err(self.error(RuntimeErrorKind::StackUnderflow)),
        }
    }

    fn peek(&self, distance: usize) -> Result<Value> {
        self.stack
            .len()
            .checked_sub(distance + 1)
            .map(|idx| self.stack[idx])
            .ok_or_else(|| self.error(RuntimeErrorKind::StackUnderflow))
    }

    fn read_byte(&mut self) -> Result<u8> {
        let byte = *self
            .chunk
            .code
            .get(self.ip)
            .ok_or_else(|| self.error_at(self.ip, RuntimeErrorKind::UnexpectedEndOfCode))?;
        self.ip += 1;
        Ok(byte)
    }

    fn read_u16(&mut self) -> Result<u16> {
        let value = self
            .chunk
            .read_u16(self.ip)
            .ok_or_else(|| self.error_at(self.ip, RuntimeErrorKind::UnexpectedEndOfCode))?;
        self.ip += 2;
        Ok(value)
    }

    fn read_constant(&mut self) -> Result<Value> {
        let idx = self.read_byte()?;
        self.chunk
            .constants
            .get(idx as usize)
            .copied()
            .ok_or_else(|| self.error(RuntimeErrorKind::InvalidName(idx)))
    }

    fn undefined_variable(&self, name: Value) -> RuntimeError {
        self.error(RuntimeErrorKind::UndefinedVariable(self.heap.display(name)))
    }

    /// Error attributed to the instruction currently executing
    fn error(&self, kind: RuntimeErrorKind) -> RuntimeError {
        self.error_at(self.ip.saturating_sub(1), kind)
    }

    fn error_at(&self, offset: usize, kind: RuntimeErrorKind) -> RuntimeError {
        let line = self
            .chunk
            .lines
            .get(offset)
            .or_else(|| self.chunk.lines.last())
            .copied()
            .unwrap_or(0);
        RuntimeError::new(kind, line)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn run_vm(source: &str) -> (InterpretResult, String) {
        let mut vm = VM::with_output(Vec::new());
        let result = vm.interpret(source);
        let output = String::from_utf8(vm.into_output()).expect("utf-8 output");
        (result, output)
    }

    fn run_chunk(chunk: Chunk) -> Result<()> {
        VM::with_output(Vec::new()).run(chunk)
    }

    #[test]
    fn test_vm_arithmetic() {
        assert_eq!(run_vm("print 1 + 2;"), (InterpretResult::Ok, "3\n".to_string()));
        assert_eq!(run_vm("print 10 - 3;").1, "7\n");
        assert_eq!(run_vm("print 4 * 5;").1, "20\n");
        assert_eq!(run_vm("print 20 / 8;").1, "2.5\n");
        assert_eq!(run_vm("print -(1 + 2) * 3;").1, "-9\n");
        assert_eq!(run_vm("print 1 / 0;").1, "inf\n");
    }

    #[test]
    fn test_vm_comparison() {
        assert_eq!(run_vm("print 1 < 2;").1, "true\n");
        assert_eq!(run_vm("print 5 > 3;").1, "true\n");
        assert_eq!(run_vm("print 2 <= 1;").1, "false\n");
        assert_eq!(run_vm("print 2 >= 2;").1, "true\n");
        assert_eq!(run_vm("print 2 == 2;").1, "true\n");
        assert_eq!(run_vm("print 1 != 2;").1, "true\n");
        assert_eq!(run_vm("print nil == false;").1, "false\n");
    }

    #[test]
    fn test_vm_not_and_falsiness() {
        assert_eq!(run_vm("print !nil;").1, "true\n");
        assert_eq!(run_vm("print !0;").1, "false\n");
        assert_eq!(run_vm("print !!\"\";").1, "true\n");
    }

    #[test]
    fn test_vm_strings() {
        assert_eq!(run_vm("print \"foo\" + \"bar\";").1, "foobar\n");
        assert_eq!(run_vm("print \"ab\" == \"a\" + \"b\";").1, "true\n");
        assert_eq!(run_vm("print \"a\" != \"b\";").1, "true\n");
    }

    #[test]
    fn test_concatenation_interns_result() {
        let mut vm = VM::with_output(Vec::new());
        assert_eq!(vm.interpret("var s = \"ab\"; var t = \"a\" + \"b\";"), InterpretResult::Ok);
        assert_eq!(vm.global("s"), vm.global("t"));
        // "s", "ab", "t", "a", "b": the concatenation found "ab" already interned
        assert_eq!(vm.heap.object_count(), 5);
    }

    #[test]
    fn test_vm_ternary() {
        assert_eq!(run_vm("print true ? 1 : 2;").1, "1\n");
        assert_eq!(run_vm("print false ? 1 : 2;").1, "2\n");
        assert_eq!(run_vm("print nil ? 1 : false ? 2 : 3;").1, "3\n");
        assert_eq!(run_vm("print true ? false ? 1 : 2 : 3;").1, "2\n");
        assert_eq!(run_vm("print (1 < 2 ? 10 : 20) + 1;").1, "11\n");
    }

    #[test]
    fn test_vm_logical() {
        assert_eq!(run_vm("print nil or 2;").1, "2\n");
        assert_eq!(run_vm("print 1 and 2;").1, "2\n");
        assert_eq!(run_vm("print false and 2;").1, "false\n");
        assert_eq!(run_vm("print 1 or undefined;").1, "1\n");
    }

    #[test]
    fn test_vm_globals() {
        let (result, output) = run_vm("var a = 1; var b; a = a + 41; print a; print b;");
        assert_eq!(result, InterpretResult::Ok);
        assert_eq!(output, "42\nnil\n");
    }

    #[test]
    fn test_undefined_variable() {
        assert_eq!(run_vm("print missing;").0, InterpretResult::RuntimeError);

        let mut vm = VM::with_output(Vec::new());
        assert_eq!(vm.interpret("missing = 1;"), InterpretResult::RuntimeError);
        assert_eq!(vm.global("missing"), None);
    }

    #[test]
    fn test_global_lookup_does_not_intern() {
        let mut vm = VM::with_output(Vec::new());
        assert_eq!(vm.interpret("var known = 1;"), InterpretResult::Ok);
        let objects = vm.heap.object_count();

        assert_eq!(vm.global("unknown"), None);
        assert_eq!(vm.global("known"), Some(Value::Number(1.0)));
        assert_eq!(vm.heap.object_count(), objects);
        assert_eq!(vm.heap.interned_count(), objects);
    }

    #[test]
    fn test_type_mismatch_is_runtime_error() {
        assert_eq!(run_vm("print -\"a\";").0, InterpretResult::RuntimeError);
        assert_eq!(run_vm("print 1 + \"a\";").0, InterpretResult::RuntimeError);
        assert_eq!(run_vm("print \"a\" * 2;").0, InterpretResult::RuntimeError);
        assert_eq!(run_vm("print true < 1;").0, InterpretResult::RuntimeError);
    }

    #[test]
    fn test_output_before_fault_is_kept() {
        let (result, output) = run_vm("print 1; print -nil; print 2;");
        assert_eq!(result, InterpretResult::RuntimeError);
        assert_eq!(output, "1\n");
    }

    #[test]
    fn test_compile_error_runs_nothing() {
        let (result, output) = run_vm("print 1; print ;");
        assert_eq!(result, InterpretResult::CompileError);
        assert_eq!(output, "");
    }

    #[test]
    fn test_pop_empty_stack() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Pop, 1);
        chunk.write(OpCode::Return, 1);

        let err = run_chunk(chunk).expect_err("pop on empty stack must fail");
        assert_eq!(err, RuntimeError::new(RuntimeErrorKind::StackUnderflow, 1));
    }

    #[test]
    fn test_binary_op_on_empty_stack() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Add, 4);
        chunk.write(OpCode::Return, 4);

        let err = run_chunk(chunk).expect_err("add on empty stack must fail");
        assert_eq!(err.kind, RuntimeErrorKind::StackUnderflow);
        assert_eq!(err.line, 4);
    }

    #[test]
    fn test_stack_overflow() {
        let mut chunk = Chunk::new();
        for _ in 0..=STACK_MAX {
            chunk.write(OpCode::Nil, 1);
        }
        chunk.write(OpCode::Return, 1);

        let err = run_chunk(chunk).expect_err("257 pushes must overflow");
        assert_eq!(err.kind, RuntimeErrorKind::StackOverflow);
    }

    #[test]
    fn test_full_stack_is_allowed() {
        let mut chunk = Chunk::new();
        for _ in 0..STACK_MAX {
            chunk.write(OpCode::True, 1);
        }
        chunk.write(OpCode::Return, 1);

        assert_eq!(run_chunk(chunk), Ok(()));
    }

    #[test]
    fn test_unknown_opcode_and_missing_return() {
        let mut chunk = Chunk::new();
        chunk.write_byte(0xEE, 2);
        let err = run_chunk(chunk).expect_err("unknown opcode");
        assert_eq!(err, RuntimeError::new(RuntimeErrorKind::UnknownOpcode(0xEE), 2));

        let mut chunk = Chunk::new();
        chunk.write(OpCode::Nil, 3);
        let err = run_chunk(chunk).expect_err("runs off the end");
        assert_eq!(err.kind, RuntimeErrorKind::UnexpectedEndOfCode);
        assert_eq!(err.line, 3);
    }

    #[test]
    fn test_vm_is_reusable_after_error() {
        let mut vm = VM::with_output(Vec::new());
        assert_eq!(vm.interpret("var x = 1; print -nil;"), InterpretResult::RuntimeError);
        assert_eq!(vm.stack_len(), 0);
        assert_eq!(vm.interpret("print x;"), InterpretResult::Ok);
        assert_eq!(vm.output(), b"1\n");
    }

    #[test]
    fn test_runtime_error_line() {
        let mut vm = VM::with_output(Vec::new());
        let chunk = compiler::compile("print 1;\n\nprint -true;", &mut vm.heap).expect("compiles");
        let err = vm.run(chunk).expect_err("negating a bool fails");
        assert_eq!(err.line, 3);
        assert_eq!(err.kind, RuntimeErrorKind::OperandMustBeNumber);
    }
}
