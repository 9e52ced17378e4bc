//! Bytecode instructions and chunks
//!
//! A chunk is an append-only byte stream with a constant pool and a line
//! number for every byte.

use crate::object::Heap;
use crate::value::Value;

/// Constant indices are single bytes
pub const MAX_CONSTANTS: usize = u8::MAX as usize + 1;

/// Opcodes for the VM
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpCode {
    // Constants and literals
    Constant,     // Push constant (u8 index)
    Nil,          // Push nil
    True,         // Push true
    False,        // Push false

    // Stack manipulation
    Pop,          // Pop top of stack

    // Globals, named by a string constant (u8 index)
    GetGlobal,
    DefineGlobal,
    SetGlobal,

    // Comparison
    Equal,
    Greater,
    Less,

    // Arithmetic
    Add,
    Subtract,
    Multiply,
    Divide,

    // Unary
    Not,
    Negate,

    // Built-ins
    Print,

    // Control flow (u16 forward offset)
    Jump,
    JumpIfFalse,

    Return,
}

impl OpCode {
    /// Number of operand bytes following the opcode
    pub fn operand_len(self) -> usize {
        match self {
            OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => 1,
            OpCode::Jump | OpCode::JumpIfFalse => 2,
            _ => 0,
        }
    }
}

impl TryFrom<u8> for OpCode {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, Self::Error> {
        use OpCode::*;
        const OPS: [OpCode; 21] = [
            Constant, Nil, True, False, Pop, GetGlobal, DefineGlobal, SetGlobal, Equal, Greater,
            Less, Add, Subtract, Multiply, Divide, Not, Negate, Print, Jump, JumpIfFalse, Return,
        ];
        OPS.get(byte as usize).copied().ok_or(byte)
    }
}

impl From<OpCode> for u8 {
    fn from(op: OpCode) -> Self {
        op as u8
    }
}

/// A chunk of bytecode with associated data
#[derive(Debug, Clone, Default)]
pub struct Chunk {
    /// The bytecode instructions
    pub code: Vec<u8>,

    /// Constant pool
    pub constants: Vec<Value>,

    /// Source line of every byte in `code`
    pub lines: Vec<usize>,
}

impl Chunk {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write an opcode to the chunk
    pub fn write(&mut self, op: OpCode, line: usize) {
        self.write_byte(op.into(), line);
    }

    /// Write a raw byte (operand)
    pub fn write_byte(&mut self, byte: u8, line: usize) {
        self.code.push(byte);
        self.lines.push(line);
    }

    /// Write a 16-bit operand, big-endian
    pub fn write_u16(&mut self, value: u16, line: usize) {
        for byte in value.to_be_bytes() {
            self.write_byte(byte, line);
        }
    }

    /// Add a constant and return its index. The caller enforces
    /// [`MAX_CONSTANTS`].
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    /// Read a 16-bit value at offset
    pub fn read_u16(&self, offset: usize) -> Option<u16> {
        let bytes = self.code.get(offset..offset + 2)?;
        Some(u16::from_be_bytes([bytes[0], bytes[1]]))
    }

    /// Source line for the byte at `offset`
    pub fn line(&self, offset: usize) -> usize {
        self.lines.get(offset).copied().unwrap_or(0)
    }

    /// Get current code length (for jump patching)
    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Point the jump operand at `offset` to the current end of code.
    /// Returns `None` if the distance does not fit in 16 bits.
    pub fn patch_jump(&mut self, offset: usize) -> Option<()> {
        let jump = u16::try_from(self.code.len() - offset - 2).ok()?;
        self.code[offset..offset + 2].copy_from_slice(&jump.to_be_bytes());
        Some(())
    }

    /// Disassemble for debugging
    pub fn disassemble(&self, name: &str, heap: &Heap) -> String {
        let mut result = format!("== {} ==\n", name);
        let mut offset = 0;

        while offset < self.code.len() {
            let (s, next) = self.disassemble_instruction(offset, heap);
            result.push_str(&s);
            result.push('\n');
            offset = next;
        }

        result
    }

    /// Render one instruction and return the offset of the next
    pub fn disassemble_instruction(&self, offset: usize, heap: &Heap) -> (String, usize) {
        let line = if offset > 0 && self.line(offset) == self.line(offset - 1) {
            "   |".to_string()
        } else {
            format!("{:4}", self.line(offset))
        };

        let byte = self.code[offset];
        let Ok(op) = OpCode::try_from(byte) else {
            return (format!("{:04} {} <unknown {}>", offset, line, byte), offset + 1);
        };

        let instr = match op {
            OpCode::Constant | OpCode::GetGlobal | OpCode::DefineGlobal | OpCode::SetGlobal => {
                match self.code.get(offset + 1) {
                    Some(&idx) => {
                        let shown = self
                            .constants
                            .get(idx as usize)
                            .map(|v| heap.display(*v))
                            .unwrap_or_else(|| "?".to_string());
                        format!("{:<16} {:4} '{}'", format!("{:?}", op), idx, shown)
                    }
                    None => format!("{:?} <truncated>", op),
                }
            }
            OpCode::Jump | OpCode::JumpIfFalse => match self.read_u16(offset + 1) {
                Some(jump) => format!(
                    "{:<16} {:4} -> {}",
                    format!("{:?}", op),
                    offset,
                    offset + 3 + jump as usize
                ),
                None => format!("{:?} <truncated>", op),
            },
            _ => format!("{:?}", op),
        };

        (format!("{:04} {} {}", offset, line, instr), offset + 1 + op.operand_len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_write() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Constant, 1);
        let idx = chunk.add_constant(Value::Number(42.0));
        chunk.write_byte(idx as u8, 1);
        chunk.write(OpCode::Return, 2);

        assert_eq!(chunk.code, vec![OpCode::Constant as u8, 0, OpCode::Return as u8]);
        assert_eq!(chunk.lines, vec![1, 1, 2]);
        assert_eq!(chunk.constants.len(), 1);
    }

    #[test]
    fn test_opcode_round_trip() {
        for byte in 0..=OpCode::Return as u8 {
            let op = OpCode::try_from(byte).expect("valid opcode");
            assert_eq!(u8::from(op), byte);
        }
        assert_eq!(OpCode::try_from(OpCode::Return as u8 + 1), Err(OpCode::Return as u8 + 1));
    }

    #[test]
    fn test_patch_jump() {
        let mut chunk = Chunk::new();
        chunk.write(OpCode::JumpIfFalse, 1);
        chunk.write_u16(0xFFFF, 1);
        chunk.write(OpCode::Pop, 1);
        chunk.write(OpCode::Nil, 1);
        assert_eq!(chunk.patch_jump(1), Some(()));
        assert_eq!(chunk.read_u16(1), Some(2));
    }

    #[test]
    fn test_disassemble() {
        let mut heap = Heap::new();
        let mut chunk = Chunk::new();
        chunk.write(OpCode::Constant, 1);
        let idx = chunk.add_constant(Value::Number(1.5));
        chunk.write_byte(idx as u8, 1);
        let name = heap.copy_string("answer");
        chunk.write(OpCode::DefineGlobal, 1);
        let idx = chunk.add_constant(Value::Obj(name));
        chunk.write_byte(idx as u8, 1);
        chunk.write(OpCode::Return, 2);

        let disasm = chunk.disassemble("test", &heap);
        assert!(disasm.starts_with("== test ==\n"));
        assert!(disasm.contains("Constant"));
        assert!(disasm.contains("'1.5'"));
        assert!(disasm.contains("'answer'"));
        assert!(disasm.contains("0004    2 Return"));
    }
}
