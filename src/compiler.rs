//! Compiler: source → bytecode
//!
//! A single-pass Pratt parser. Tokens are pulled from the lexer on demand
//! and bytecode is emitted straight into a [`Chunk`]; no syntax tree is
//! built.

use tracing::debug;

use crate::bytecode::{Chunk, OpCode, MAX_CONSTANTS};
use crate::error::{CompileError, Diagnostic, Location};
use crate::lexer::Lexer;
use crate::object::Heap;
use crate::token::{Token, TokenKind};
use crate::value::Value;

/// Deepest expression nesting the compiler will recurse into
pub const MAX_NESTING: usize = 1024;

/// Binding power, lowest first
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Precedence {
    None,
    Assignment, // =
    Ternary,    // ?:
    Or,         // or
    And,        // and
    Equality,   // == !=
    Comparison, // < > <= >=
    Term,       // + -
    Factor,     // * /
    Unary,      // ! -
    Call,       // . ()
    Primary,
}

impl Precedence {
    /// The next-higher level, used for left-associative operands
    pub fn next(self) -> Precedence {
        use Precedence::*;
        match self {
            None => Assignment,
            Assignment => Ternary,
            Ternary => Or,
            Or => And,
            And => Equality,
            Equality => Comparison,
            Comparison => Term,
            Term => Factor,
            Factor => Unary,
            Unary => Call,
            Call | Primary => Primary,
        }
    }
}

/// Handlers for a token in prefix position
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Prefix {
    Grouping,
    Unary,
    Number,
    String,
    Literal,
    Variable,
}

/// Handlers for a token between two operands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Infix {
    Binary,
    And,
    Or,
}

/// Handlers for the pieces of a multi-token operator
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mixfix {
    /// `?` of `cond ? then : else`
    Conditional,
    /// `:` of `cond ? then : else`
    Alternative,
}

/// Parse rule for one token kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ParseRule {
    pub prefix: Option<Prefix>,
    pub infix: Option<Infix>,
    pub mixfix: Option<Mixfix>,
    pub precedence: Precedence,
}

impl ParseRule {
    const fn new(
        prefix: Option<Prefix>,
        infix: Option<Infix>,
        mixfix: Option<Mixfix>,
        precedence: Precedence,
    ) -> Self {
        Self { prefix, infix, mixfix, precedence }
    }

    pub fn for_kind(kind: TokenKind) -> ParseRule {
        use crate::token::TokenKind as K;
        #[rustfmt::skip]
        let rule = match kind {
            K::LeftParen    => Self::new(Some(Prefix::Grouping), None, None, Precedence::None),
            K::Minus        => Self::new(Some(Prefix::Unary), Some(Infix::Binary), None, Precedence::Term),
            K::Plus         => Self::new(None, Some(Infix::Binary), None, Precedence::Term),
            K::Slash        => Self::new(None, Some(Infix::Binary), None, Precedence::Factor),
            K::Star         => Self::new(None, Some(Infix::Binary), None, Precedence::Factor),
            K::Bang         => Self::new(Some(Prefix::Unary), None, None, Precedence::None),
            K::BangEqual    => Self::new(None, Some(Infix::Binary), None, Precedence::Equality),
            K::EqualEqual   => Self::new(None, Some(Infix::Binary), None, Precedence::Equality),
            K::Greater      => Self::new(None, Some(Infix::Binary), None, Precedence::Comparison),
            K::GreaterEqual => Self::new(None, Some(Infix::Binary), None, Precedence::Comparison),
            K::Less         => Self::new(None, Some(Infix::Binary), None, Precedence::Comparison),
            K::LessEqual    => Self::new(None, Some(Infix::Binary), None, Precedence::Comparison),
            K::Question     => Self::new(None, None, Some(Mixfix::Conditional), Precedence::Ternary),
            K::Colon        => Self::new(None, None, Some(Mixfix::Alternative), Precedence::Ternary),
            K::Identifier   => Self::new(Some(Prefix::Variable), None, None, Precedence::None),
            K::String       => Self::new(Some(Prefix::String), None, None, Precedence::None),
            K::Number       => Self::new(Some(Prefix::Number), None, None, Precedence::None),
            K::And          => Self::new(None, Some(Infix::And), None, Precedence::And),
            K::Or           => Self::new(None, Some(Infix::Or), None, Precedence::Or),
            K::False | K::True | K::Nil
                            => Self::new(Some(Prefix::Literal), None, None, Precedence::None),
            _               => Self::new(None, None, None, Precedence::None),
        };
        rule
    }
}

/// Token cursor plus error state
pub struct Parser<'src> {
    lexer: Lexer<'src>,
    pub current: Token<'src>,
    pub previous: Token<'src>,
    pub had_error: bool,
    pub panic_mode: bool,
    diagnostics: Vec<Diagnostic>,
}

impl<'src> Parser<'src> {
    pub fn new(source: &'src str) -> Self {
        Self {
            lexer: Lexer::new(source),
            current: Token::synthetic(),
            previous: Token::synthetic(),
            had_error: false,
            panic_mode: false,
            diagnostics: Vec::new(),
        }
    }

    /// Move to the next non-error token, reporting error tokens on the way
    pub fn advance(&mut self) {
        self.previous = self.current;

        loop {
            self.current = self.lexer.next_token();
            if self.current.kind != TokenKind::Error {
                break;
            }

            let message = self.current.lexeme;
            self.error_at_current(message);
        }
    }

    pub fn consume(&mut self, kind: TokenKind, message: &str) {
        if self.current.kind == kind {
            self.advance();
        } else {
            self.error_at_current(message);
        }
    }

    pub fn check(&self, kind: TokenKind) -> bool {
        self.current.kind == kind
    }

    pub fn matches(&mut self, kind: TokenKind) -> bool {
        if !self.check(kind) {
            return false;
        }
        self.advance();
        true
    }

    pub fn error(&mut self, message: &str) {
        self.error_at(self.previous, message);
    }

    pub fn error_at_current(&mut self, message: &str) {
        self.error_at(self.current, message);
    }

    fn error_at(&mut self, token: Token<'src>, message: &str) {
        if self.panic_mode {
            return;
        }
        self.panic_mode = true;

        let location = match token.kind {
            TokenKind::Eof => Location::End,
            TokenKind::Error => Location::Unspecified,
            _ => Location::Lexeme(token.lexeme.to_string()),
        };
        self.diagnostics.push(Diagnostic {
            line: token.line(),
            location,
            message: message.to_string(),
        });
        self.had_error = true;
    }

    /// Leave panic mode and skip to something that looks like the start of
    /// the next statement
    pub fn synchronize(&mut self) {
        use TokenKind::*;

        self.panic_mode = false;

        while self.current.kind != Eof {
            if self.previous.kind == Semicolon {
                return;
            }

            match self.current.kind {
                Class | Fun | Var | For | If | While | Print | Return => return,
                _ => self.advance(),
            }
        }
    }

    pub fn diagnostics(&self) -> &[Diagnostic] {
        &self.diagnostics
    }
}

/// The bytecode compiler for one compilation unit
pub struct Compiler<'src, 'heap> {
    parser: Parser<'src>,
    heap: &'heap mut Heap,
    chunk: Chunk,
    /// Else-jumps of `?` operators still waiting for their `:`
    pending_conditionals: Vec<usize>,
    /// Active `parse_precedence` calls
    depth: usize,
}

/// Compile `source` into a chunk, interning string literals into `heap`
pub fn compile(source: &str, heap: &mut Heap) -> Result<Chunk, CompileError> {
    Compiler::new(source, heap).compile()
}

impl<'src, 'heap> Compiler<'src, 'heap> {
    pub fn new(source: &'src str, heap: &'heap mut Heap) -> Self {
        Self {
            parser: Parser::new(source),
            heap,
            chunk: Chunk::new(),
            pending_conditionals: Vec::new(),
            depth: 0,
        }
    }

    /// Compile the whole unit. Every diagnostic is collected; the chunk is
    /// only returned when there were none.
    pub fn compile(mut self) -> Result<Chunk, CompileError> {
        self.parser.advance();

        while !self.parser.matches(TokenKind::Eof) {
            self.declaration();
        }
        self.end_compiler();

        debug!(
            code_bytes = self.chunk.len(),
            constants = self.chunk.constants.len(),
            errors = self.parser.diagnostics.len(),
            "compiled chunk"
        );

        if self.parser.had_error {
            Err(CompileError { diagnostics: self.parser.diagnostics })
        } else {
            Ok(self.chunk)
        }
    }

    // ==================== Emission ====================

    fn emit(&mut self, op: OpCode) {
        let line = self.parser.previous.line();
        self.chunk.write(op, line);
    }

    fn emit_byte(&mut self, byte: u8) {
        let line = self.parser.previous.line();
        self.chunk.write_byte(byte, line);
    }

    fn emit_with_operand(&mut self, op: OpCode, operand: u8) {
        self.emit(op);
        self.emit_byte(operand);
    }

    fn make_constant(&mut self, value: Value) -> u8 {
        if self.chunk.constants.len() >= MAX_CONSTANTS {
            self.parser.error("Too many constants in one chunk.");
            return 0;
        }
        // Below MAX_CONSTANTS, so the index fits in a byte
        self.chunk.add_constant(value) as u8
    }

    fn emit_constant(&mut self, value: Value) {
        let idx = self.make_constant(value);
        self.emit_with_operand(OpCode::Constant, idx);
    }

    fn emit_jump(&mut self, op: OpCode) -> usize {
        self.emit(op);
        let line = self.parser.previous.line();
        self.chunk.write_u16(0xFFFF, line);
        self.chunk.len() - 2
    }

    fn patch_jump(&mut self, offset: usize) {
        if self.chunk.patch_jump(offset).is_none() {
            self.parser.error("Too much code to jump over.");
        }
    }

    fn end_compiler(&mut self) {
        self.emit(OpCode::Return);
    }

    fn identifier_constant(&mut self, name: &str) -> u8 {
        let handle = self.heap.copy_string(name);
        self.make_constant(Value::Obj(handle))
    }

    // ==================== Declarations and statements ====================

    fn declaration(&mut self) {
        if self.parser.matches(TokenKind::Var) {
            self.var_declaration();
        } else {
            self.statement();
        }

        if self.parser.panic_mode {
            self.parser.synchronize();
        }
    }

    fn var_declaration(&mut self) {
        self.parser.consume(TokenKind::Identifier, "Expect variable name.");
        let name = self.parser.previous.lexeme;
        let global = self.identifier_constant(name);

        if self.parser.matches(TokenKind::Equal) {
            self.expression();
        } else {
            self.emit(OpCode::Nil);
        }
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after variable declaration.");

        self.emit_with_operand(OpCode::DefineGlobal, global);
    }

    fn statement(&mut self) {
        if self.parser.matches(TokenKind::Print) {
            self.print_statement();
        } else {
            self.expression_statement();
        }
    }

    fn print_statement(&mut self) {
        self.expression();
        self.parser.consume(TokenKind::Semicolon, "Expect ';' after value.");
        self.emit(OpCode::Print);
    }

    fn expression_statement(&mut self) {
        self.expression();
        self.parser
            .consume(TokenKind::Semicolon, "Expect ';' after expression.");
        self.emit(OpCode::Pop);
    }

    // ==================== Expressions ====================

    fn expression(&mut self) {
        self.parse_precedence(Precedence::Assignment);
    }

    fn parse_precedence(&mut self, precedence: Precedence) {
        if self.depth >= MAX_NESTING {
            self.parser.error_at_current("Expression nests too deeply.");
            return;
        }

        self.depth += 1;
        self.parse_operand(precedence);
        self.depth -= 1;
    }

    /// One prefix expression, then every operator binding at least as
    /// tightly as `precedence`
    fn parse_operand(&mut self, precedence: Precedence) {
        self.parser.advance();
        let Some(prefix) = ParseRule::for_kind(self.parser.previous.kind).prefix else {
            self.parser.error("Expect expression.");
            return;
        };

        let can_assign = precedence <= Precedence::Assignment;
        self.prefix(prefix, can_assign);

        while precedence <= ParseRule::for_kind(self.parser.current.kind).precedence {
            self.parser.advance();
            let rule = ParseRule::for_kind(self.parser.previous.kind);
            // Mixfix takes priority when a token registers both
            if let Some(mixfix) = rule.mixfix {
                self.mixfix(mixfix);
            } else if let Some(infix) = rule.infix {
                self.infix(infix);
            }
        }

        if can_assign && self.parser.matches(TokenKind::Equal) {
            self.parser.error("Invalid assignment target.");
        }
    }

    fn prefix(&mut self, prefix: Prefix, can_assign: bool) {
        match prefix {
            Prefix::Grouping => self.grouping(),
            Prefix::Unary => self.unary(),
            Prefix::Number => self.number(),
            Prefix::String => self.string(),
            Prefix::Literal => self.literal(),
            Prefix::Variable => self.variable(can_assign),
        }
    }

    fn infix(&mut self, infix: Infix) {
        match infix {
            Infix::Binary => self.binary(),
            Infix::And => self.and(),
            Infix::Or => self.or(),
        }
    }

    fn mixfix(&mut self, mixfix: Mixfix) {
        match mixfix {
            Mixfix::Conditional => self.conditional(),
            Mixfix::Alternative => self.alternative(),
        }
    }

    fn grouping(&mut self) {
        // A ':' inside parentheses never closes a '?' outside them
        let outer = std::mem::take(&mut self.pending_conditionals);
        self.expression();
        self.pending_conditionals = outer;
        self.parser
            .consume(TokenKind::RightParen, "Expect ')' after expression.");
    }

    fn unary(&mut self) {
        let operator = self.parser.previous.kind;

        self.parse_precedence(Precedence::Unary);

        match operator {
            TokenKind::Bang => self.emit(OpCode::Not),
            TokenKind::Minus => self.emit(OpCode::Negate),
            _ => unreachable!("unary rule registered for {operator}"),
        }
    }

    fn binary(&mut self) {
        let operator = self.parser.previous.kind;
        let rule = ParseRule::for_kind(operator);
        self.parse_precedence(rule.precedence.next());

        use crate::bytecode::OpCode as Op;
        match operator {
            TokenKind::BangEqual => self.emit_pair(Op::Equal, Op::Not),
            TokenKind::EqualEqual => self.emit(Op::Equal),
            TokenKind::Greater => self.emit(Op::Greater),
            TokenKind::GreaterEqual => self.emit_pair(Op::Less, Op::Not),
            TokenKind::Less => self.emit(Op::Less),
            TokenKind::LessEqual => self.emit_pair(Op::Greater, Op::Not),
            TokenKind::Plus => self.emit(Op::Add),
            TokenKind::Minus => self.emit(Op::Subtract),
            TokenKind::Star => self.emit(Op::Multiply),
            TokenKind::Slash => self.emit(Op::Divide),
            _ => unreachable!("binary rule registered for {operator}"),
        }
    }

    fn emit_pair(&mut self, first: OpCode, second: OpCode) {
        self.emit(first);
        self.emit(second);
    }

    fn and(&mut self) {
        let end_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::And);
        self.patch_jump(end_jump);
    }

    fn or(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Or);
        self.patch_jump(end_jump);
    }

    /// `?`: branch on the condition already on the stack, then compile the
    /// then-branch. Its `:` is consumed by [`Self::alternative`] from inside
    /// that parse.
    fn conditional(&mut self) {
        let else_jump = self.emit_jump(OpCode::JumpIfFalse);
        self.emit(OpCode::Pop);

        let depth = self.pending_conditionals.len();
        self.pending_conditionals.push(else_jump);
        self.parse_precedence(Precedence::Ternary);

        if self.pending_conditionals.len() > depth {
            self.pending_conditionals.truncate(depth);
            self.parser
                .error_at_current("Expect ':' after then branch of conditional expression.");
        }
    }

    /// `:`: close the innermost open `?` and compile the else-branch.
    /// Parsing it at ternary level makes the operator right-associative.
    fn alternative(&mut self) {
        let Some(else_jump) = self.pending_conditionals.pop() else {
            self.parser.error("Expect '?' before ':'.");
            return;
        };

        let end_jump = self.emit_jump(OpCode::Jump);
        self.patch_jump(else_jump);
        self.emit(OpCode::Pop);
        self.parse_precedence(Precedence::Ternary);
        self.patch_jump(end_jump);
    }

    fn number(&mut self) {
        match self.parser.previous.lexeme.parse::<f64>() {
            Ok(value) => self.emit_constant(Value::Number(value)),
            Err(_) => self.parser.error("Invalid number literal."),
        }
    }

    fn string(&mut self) {
        let lexeme = self.parser.previous.lexeme;
        // Strip the surrounding quotes
        let contents = &lexeme[1..lexeme.len() - 1];
        let handle = self.heap.copy_string(contents);
        self.emit_constant(Value::Obj(handle));
    }

    fn literal(&mut self) {
        match self.parser.previous.kind {
            TokenKind::False => self.emit(OpCode::False),
            TokenKind::True => self.emit(OpCode::True),
            TokenKind::Nil => self.emit(OpCode::Nil),
            kind => unreachable!("literal rule registered for {kind}"),
        }
    }

    fn variable(&mut self, can_assign: bool) {
        let name = self.parser.previous.lexeme;
        let arg = self.identifier_constant(name);

        if can_assign && self.parser.matches(TokenKind::Equal) {
            self.expression();
            self.emit_with_operand(OpCode::SetGlobal, arg);
        } else {
            self.emit_with_operand(OpCode::GetGlobal, arg);
        }
    }
}
