//! Lexer: source text → token stream.
//!
//! The lexer is a forward scanner with exactly one token of lookahead
//! ([`Lexer::peek_token`]). Template literals are handled with a mode flag:
//! between backticks the scanner emits raw [`TokenKind::TemplateText`] runs,
//! and a `${` switches back to ordinary lexing until the matching `}` closes
//! the interpolation (brace depth is tracked so nested braces inside the
//! expression do not end it early).
//!
//! Lexical errors never abort the scan: a malformed token is emitted as
//! [`TokenKind::Error`] with the diagnostic in its lexeme and scanning
//! continues, so the parser can report every problem in one pass.

use crate::token::{keyword_kind, Token, TokenKind};

pub struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    column: u32,
    /// True while scanning raw text between backticks.
    in_template: bool,
    /// Brace depth inside a `${…}` interpolation; 0 when not interpolating.
    interp_depth: u32,
    peeked: Option<Token>,
}

impl Lexer {
    pub fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            column: 1,
            in_template: false,
            interp_depth: 0,
            peeked: None,
        }
    }

    /// Advance and return the next token.
    pub fn next_token(&mut self) -> Token {
        if let Some(tok) = self.peeked.take() {
            return tok;
        }
        self.scan_token()
    }

    /// Return the next token without consuming it.
    pub fn peek_token(&mut self) -> &Token {
        if self.peeked.is_none() {
            self.peeked = Some(self.scan_token());
        }
        self.peeked.as_ref().unwrap()
    }

    // -----------------------------------------------------------------------
    // Character primitives
    // -----------------------------------------------------------------------

    fn current(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn lookahead(&self) -> Option<char> {
        self.chars.get(self.pos + 1).copied()
    }

    fn advance(&mut self) -> Option<char> {
        let c = self.current()?;
        self.pos += 1;
        if c == '\n' {
            self.line += 1;
            self.column = 1;
        } else {
            self.column += 1;
        }
        Some(c)
    }

    fn matches(&mut self, expected: char) -> bool {
        if self.current() == Some(expected) {
            self.advance();
            true
        } else {
            false
        }
    }

    // -----------------------------------------------------------------------
    // Scanning
    // -----------------------------------------------------------------------

    fn scan_token(&mut self) -> Token {
        if self.in_template {
            return self.scan_template_text();
        }

        self.skip_whitespace_and_comments();

        let line = self.line;
        let column = self.column;

        let c = match self.advance() {
            Some(c) => c,
            None => return Token::eof(line, column),
        };

        let simple = |kind: TokenKind, text: &str| Token::new(kind, text, line, column);

        match c {
            '`' => {
                self.in_template = true;
                simple(TokenKind::Backtick, "`")
            }
            '(' => simple(TokenKind::LeftParen, "("),
            ')' => simple(TokenKind::RightParen, ")"),
            '{' => {
                if self.interp_depth > 0 {
                    self.interp_depth += 1;
                }
                simple(TokenKind::LeftBrace, "{")
            }
            '}' => {
                if self.interp_depth > 0 {
                    self.interp_depth -= 1;
                    if self.interp_depth == 0 {
                        // The interpolation is over; resume raw template text.
                        self.in_template = true;
                    }
                }
                simple(TokenKind::RightBrace, "}")
            }
            '[' => simple(TokenKind::LeftBracket, "["),
            ']' => simple(TokenKind::RightBracket, "]"),
            ';' => simple(TokenKind::Semicolon, ";"),
            ',' => simple(TokenKind::Comma, ","),
            '.' => simple(TokenKind::Dot, "."),
            '+' => simple(TokenKind::Plus, "+"),
            '-' => simple(TokenKind::Minus, "-"),
            '*' => simple(TokenKind::Star, "*"),
            '/' => simple(TokenKind::Slash, "/"),
            '%' => simple(TokenKind::Percent, "%"),
            '?' => simple(TokenKind::Question, "?"),
            ':' => simple(TokenKind::Colon, ":"),
            '=' => simple(TokenKind::Equal, "="),
            '!' => {
                if self.matches('=') {
                    simple(TokenKind::NotEqual, "!=")
                } else {
                    Token::new(TokenKind::Error, "Unexpected character '!'", line, column)
                }
            }
            '<' => {
                if self.matches('=') {
                    simple(TokenKind::LessEqual, "<=")
                } else {
                    simple(TokenKind::Less, "<")
                }
            }
            '>' => {
                if self.matches('=') {
                    simple(TokenKind::GreaterEqual, ">=")
                } else {
                    simple(TokenKind::Greater, ">")
                }
            }
            '"' | '\'' => self.scan_string(c, line, column),
            c if c.is_ascii_digit() => self.scan_number(c, line, column),
            c if c.is_alphabetic() || c == '_' => self.scan_identifier(c, line, column),
            c => Token::new(
                TokenKind::Error,
                format!("Unexpected character '{c}'"),
                line,
                column,
            ),
        }
    }

    fn skip_whitespace_and_comments(&mut self) {
        loop {
            match self.current() {
                Some(' ' | '\t' | '\r' | '\n') => {
                    self.advance();
                }
                Some('/') if self.lookahead() == Some('/') => {
                    while let Some(c) = self.current() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                Some('/') if self.lookahead() == Some('*') => {
                    self.advance();
                    self.advance();
                    while let Some(c) = self.advance() {
                        if c == '*' && self.current() == Some('/') {
                            self.advance();
                            break;
                        }
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_string(&mut self, quote: char, line: u32, column: u32) -> Token {
        let mut value = String::new();
        loop {
            match self.current() {
                None | Some('\n') => {
                    return Token::new(TokenKind::Error, "Unterminated string literal", line, column);
                }
                Some(c) if c == quote => {
                    self.advance();
                    return Token::new(TokenKind::StringLiteral, value, line, column);
                }
                Some('\\') => {
                    self.advance();
                    match self.advance() {
                        Some('n') => value.push('\n'),
                        Some('t') => value.push('\t'),
                        Some('r') => value.push('\r'),
                        Some('\\') => value.push('\\'),
                        Some('"') => value.push('"'),
                        Some('\'') => value.push('\''),
                        // Unknown escape: keep the escaped character as-is.
                        Some(other) => value.push(other),
                        None => {
                            return Token::new(
                                TokenKind::Error,
                                "Unterminated string literal",
                                line,
                                column,
                            );
                        }
                    }
                }
                Some(c) => {
                    self.advance();
                    value.push(c);
                }
            }
        }
    }

    fn scan_number(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);

        // Hex literal: 0x with at least one hex digit.
        if first == '0' && matches!(self.current(), Some('x' | 'X')) {
            text.push(self.advance().unwrap());
            let mut digits = 0;
            while let Some(c) = self.current() {
                if c.is_ascii_hexdigit() {
                    text.push(c);
                    self.advance();
                    digits += 1;
                } else {
                    break;
                }
            }
            if digits == 0 {
                return Token::new(
                    TokenKind::Error,
                    "Hex literal requires at least one digit",
                    line,
                    column,
                );
            }
            return Token::new(TokenKind::HexLiteral, text, line, column);
        }

        while let Some(c) = self.current() {
            if c.is_ascii_digit() {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }

        // A '.' only belongs to the number if a digit follows; otherwise it
        // is the member-access operator.
        if self.current() == Some('.') && self.lookahead().is_some_and(|c| c.is_ascii_digit()) {
            text.push('.');
            self.advance();
            while let Some(c) = self.current() {
                if c.is_ascii_digit() {
                    text.push(c);
                    self.advance();
                } else {
                    break;
                }
            }
            return Token::new(TokenKind::FloatLiteral, text, line, column);
        }

        Token::new(TokenKind::IntLiteral, text, line, column)
    }

    fn scan_identifier(&mut self, first: char, line: u32, column: u32) -> Token {
        let mut text = String::new();
        text.push(first);
        while let Some(c) = self.current() {
            if c.is_alphanumeric() || c == '_' {
                text.push(c);
                self.advance();
            } else {
                break;
            }
        }
        let kind = keyword_kind(&text).unwrap_or(TokenKind::Identifier);
        Token::new(kind, text, line, column)
    }

    /// Scan a raw text run inside a template literal.
    ///
    /// Emits the accumulated text, or — when positioned directly at a
    /// delimiter — the closing backtick / `${` token itself.
    fn scan_template_text(&mut self) -> Token {
        let line = self.line;
        let column = self.column;
        let mut text = String::new();

        loop {
            match self.current() {
                None => {
                    if text.is_empty() {
                        self.in_template = false;
                        return Token::new(
                            TokenKind::Error,
                            "Unterminated template literal",
                            line,
                            column,
                        );
                    }
                    return Token::new(TokenKind::TemplateText, text, line, column);
                }
                Some('`') => {
                    if text.is_empty() {
                        self.advance();
                        self.in_template = false;
                        return Token::new(TokenKind::Backtick, "`", line, column);
                    }
                    return Token::new(TokenKind::TemplateText, text, line, column);
                }
                Some('$') if self.lookahead() == Some('{') => {
                    if text.is_empty() {
                        self.advance();
                        self.advance();
                        self.in_template = false;
                        self.interp_depth = 1;
                        return Token::new(TokenKind::TemplateStart, "${", line, column);
                    }
                    return Token::new(TokenKind::TemplateText, text, line, column);
                }
                Some(c) => {
                    self.advance();
                    text.push(c);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn kinds(source: &str) -> Vec<TokenKind> {
        let mut lexer = Lexer::new(source);
        let mut out = Vec::new();
        loop {
            let tok = lexer.next_token();
            let kind = tok.kind;
            out.push(kind);
            if kind == TokenKind::Eof {
                return out;
            }
        }
    }

    #[test]
    fn keywords_and_identifiers() {
        assert_eq!(
            kinds("var x: 1;"),
            vec![
                TokenKind::Var,
                TokenKind::Identifier,
                TokenKind::Colon,
                TokenKind::IntLiteral,
                TokenKind::Semicolon,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn operators() {
        assert_eq!(
            kinds("a != b <= c >= d"),
            vec![
                TokenKind::Identifier,
                TokenKind::NotEqual,
                TokenKind::Identifier,
                TokenKind::LessEqual,
                TokenKind::Identifier,
                TokenKind::GreaterEqual,
                TokenKind::Identifier,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn comments_are_skipped() {
        assert_eq!(
            kinds("1 // line\n /* block\n comment */ 2"),
            vec![TokenKind::IntLiteral, TokenKind::IntLiteral, TokenKind::Eof]
        );
    }

    #[test]
    fn hex_literal_requires_digits() {
        let mut lexer = Lexer::new("0x");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Error);
        assert_eq!(tok.lexeme, "Hex literal requires at least one digit");

        let mut lexer = Lexer::new("0xFF");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::HexLiteral);
        assert_eq!(tok.lexeme, "0xFF");
    }

    #[test]
    fn float_needs_digit_after_dot() {
        // `1.` is an int followed by member access, not a float.
        assert_eq!(
            kinds("1.foo 2.5"),
            vec![
                TokenKind::IntLiteral,
                TokenKind::Dot,
                TokenKind::Identifier,
                TokenKind::FloatLiteral,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn string_escapes() {
        let mut lexer = Lexer::new(r#""a\n\t\q""#);
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::StringLiteral);
        assert_eq!(tok.lexeme, "a\n\tq");
    }

    #[test]
    fn unterminated_string_is_error_token() {
        let mut lexer = Lexer::new("\"abc");
        let tok = lexer.next_token();
        assert_eq!(tok.kind, TokenKind::Error);
        assert_eq!(tok.lexeme, "Unterminated string literal");
        // The lexer keeps going afterwards.
        assert_eq!(lexer.next_token().kind, TokenKind::Eof);
    }

    #[test]
    fn template_literal_tokens() {
        assert_eq!(
            kinds("`hi ${1 + 2} bye`"),
            vec![
                TokenKind::Backtick,
                TokenKind::TemplateText,
                TokenKind::TemplateStart,
                TokenKind::IntLiteral,
                TokenKind::Plus,
                TokenKind::IntLiteral,
                TokenKind::RightBrace,
                TokenKind::TemplateText,
                TokenKind::Backtick,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn template_tracks_brace_depth() {
        // The inner braces of the interpolation must not end template mode.
        assert_eq!(
            kinds("`${ {} }`"),
            vec![
                TokenKind::Backtick,
                TokenKind::TemplateStart,
                TokenKind::LeftBrace,
                TokenKind::RightBrace,
                TokenKind::RightBrace,
                TokenKind::Backtick,
                TokenKind::Eof,
            ]
        );
    }

    #[test]
    fn peek_does_not_consume() {
        let mut lexer = Lexer::new("var x");
        assert_eq!(lexer.peek_token().kind, TokenKind::Var);
        assert_eq!(lexer.next_token().kind, TokenKind::Var);
        assert_eq!(lexer.next_token().kind, TokenKind::Identifier);
    }

    #[test]
    fn positions_are_one_based() {
        let mut lexer = Lexer::new("a\n  b");
        let a = lexer.next_token();
        assert_eq!((a.line, a.column), (1, 1));
        let b = lexer.next_token();
        assert_eq!((b.line, b.column), (2, 3));
    }
}
