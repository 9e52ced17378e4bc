//! Lexer for loxvm
//!
//! Produces tokens on demand. Malformed input becomes an error token whose
//! lexeme is the message; scanning simply continues after it.

use crate::token::{lookup_keyword, Span, Token, TokenKind};

/// The lexer state
pub struct Lexer<'src> {
    source: &'src str,
    chars: std::iter::Peekable<std::str::CharIndices<'src>>,
    current_pos: usize,
    line: usize,
    column: usize,
}

impl<'src> Lexer<'src> {
    /// Create a new lexer from source code
    pub fn new(source: &'src str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            current_pos: 0,
            line: 1,
            column: 1,
        }
    }

    /// Scan the next token. Returns `Eof` forever once the input is exhausted.
    pub fn next_token(&mut self) -> Token<'src> {
        self.skip_whitespace_and_comments();

        let start_pos = self.current_pos;
        let start_line = self.line;
        let start_column = self.column;

        let Some(ch) = self.advance() else {
            return Token::new(
                TokenKind::Eof,
                "",
                Span::new(start_pos, start_pos, start_line, start_column),
            );
        };

        let kind = match ch {
            '(' => TokenKind::LeftParen,
            ')' => TokenKind::RightParen,
            '{' => TokenKind::LeftBrace,
            '}' => TokenKind::RightBrace,
            ',' => TokenKind::Comma,
            '.' => TokenKind::Dot,
            '-' => TokenKind::Minus,
            '+' => TokenKind::Plus,
            ';' => TokenKind::Semicolon,
            '/' => TokenKind::Slash,
            '*' => TokenKind::Star,
            '?' => TokenKind::Question,
            ':' => TokenKind::Colon,
            '!' => self.either('=', TokenKind::BangEqual, TokenKind::Bang),
            '=' => self.either('=', TokenKind::EqualEqual, TokenKind::Equal),
            '<' => self.either('=', TokenKind::LessEqual, TokenKind::Less),
            '>' => self.either('=', TokenKind::GreaterEqual, TokenKind::Greater),
            '"' => match self.scan_string() {
                Some(kind) => kind,
                None => {
                    return self.error_token("Unterminated string.", start_pos, start_line, start_column)
                }
            },
            c if c.is_ascii_digit() => self.scan_number(),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(start_pos),
            _ => return self.error_token("Unexpected character.", start_pos, start_line, start_column),
        };

        Token::new(
            kind,
            &self.source[start_pos..self.current_pos],
            Span::new(start_pos, self.current_pos, start_line, start_column),
        )
    }

    fn error_token(
        &self,
        message: &'static str,
        start: usize,
        line: usize,
        column: usize,
    ) -> Token<'src> {
        Token::new(TokenKind::Error, message, Span::new(start, self.current_pos, line, column))
    }

    /// Advance and return the current character
    fn advance(&mut self) -> Option<char> {
        let (pos, ch) = self.chars.next()?;
        self.current_pos = pos + ch.len_utf8();
        if ch == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(ch)
    }

    /// Peek at the next character without advancing
    fn peek_char(&mut self) -> Option<char> {
        self.chars.peek().map(|&(_, ch)| ch)
    }

    fn either(&mut self, expected: char, matched: TokenKind, otherwise: TokenKind) -> TokenKind {
        if self.peek_char() == Some(expected) {
            self.advance();
            matched
        } else {
            otherwise
        }
    }

    /// Skip whitespace and `//` comments
    fn skip_whitespace_and_comments(&mut self) {
        while let Some(ch) = self.peek_char() {
            match ch {
                ' ' | '\t' | '\r' | '\n' => {
                    self.advance();
                }
                '/' if self.source[self.current_pos..].starts_with("//") => {
                    while let Some(c) = self.peek_char() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    /// Scan a string literal; the opening quote is already consumed.
    /// Strings may span lines and have no escape sequences.
    fn scan_string(&mut self) -> Option<TokenKind> {
        loop {
            match self.advance()? {
                '"' => return Some(TokenKind::String),
                _ => continue,
            }
        }
    }

    /// Scan a number literal
    fn scan_number(&mut self) -> TokenKind {
        self.skip_digits();

        // A fractional part needs a digit after the dot
        let rest = &self.source[self.current_pos..];
        let mut ahead = rest.chars();
        if ahead.next() == Some('.') && ahead.next().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
            self.skip_digits();
        }

        TokenKind::Number
    }

    fn skip_digits(&mut self) {
        while self.peek_char().is_some_and(|c| c.is_ascii_digit()) {
            self.advance();
        }
    }

    /// Scan an identifier or keyword
    fn scan_identifier(&mut self, start: usize) -> TokenKind {
        while self.peek_char().is_some_and(|c| c.is_alphanumeric() || c == '_') {
            self.advance();
        }

        lookup_keyword(&self.source[start..self.current_pos]).unwrap_or(TokenKind::Identifier)
    }
}

impl<'src> Iterator for Lexer<'src> {
    type Item = Token<'src>;

    /// Yields every token up to, but not including, `Eof`.
    fn next(&mut self) -> Option<Self::Item> {
        let token = self.next_token();
        (token.kind != TokenKind::Eof).then_some(token)
    }
}
