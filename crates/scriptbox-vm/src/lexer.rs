//! Hand-written lexer. Newlines are significant (statement separators).

use crate::error::SyntaxError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Tok {
    Int(i64),
    Str(String),
    Sym(String),
    Ident(String),
    /// Top-level slot, `@name`. The inject/extract surface.
    Slot(String),

    KwNil,
    KwTrue,
    KwFalse,
    KwIf,
    KwElsif,
    KwElse,
    KwEnd,
    KwWhile,
    KwDef,
    KwReturn,
    KwRaise,
    KwBreak,
    KwDo,
    KwThen,

    Plus,
    Minus,
    Star,
    Slash,
    Percent,
    EqEq,
    NotEq,
    Lt,
    Le,
    Gt,
    Ge,
    AndAnd,
    OrOr,
    Bang,
    Assign,
    FatArrow,
    Comma,
    Colon,
    LParen,
    RParen,
    LBracket,
    RBracket,
    LBrace,
    RBrace,
    Newline,
    Eof,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
    pub col: u32,
}

pub struct Lexer<'a> {
    path: &'a str,
    src: &'a [u8],
    pos: usize,
    line: u32,
    col: u32,
}

fn keyword(word: &str) -> Option<Tok> {
    Some(match word {
        "nil" => Tok::KwNil,
        "true" => Tok::KwTrue,
        "false" => Tok::KwFalse,
        "if" => Tok::KwIf,
        "elsif" => Tok::KwElsif,
        "else" => Tok::KwElse,
        "end" => Tok::KwEnd,
        "while" => Tok::KwWhile,
        "def" => Tok::KwDef,
        "return" => Tok::KwReturn,
        "raise" => Tok::KwRaise,
        "break" => Tok::KwBreak,
        "do" => Tok::KwDo,
        "then" => Tok::KwThen,
        _ => return None,
    })
}

impl<'a> Lexer<'a> {
    pub fn new(path: &'a str, src: &'a str) -> Self {
        Self {
            path,
            src: src.as_bytes(),
            pos: 0,
            line: 1,
            col: 1,
        }
    }

    pub fn tokenize(mut self) -> Result<Vec<Token>, SyntaxError> {
        let mut out = Vec::new();
        loop {
            let token = self.next_token()?;
            let done = token.tok == Tok::Eof;
            // Collapse runs of newlines.
            if token.tok == Tok::Newline
                && matches!(out.last(), None | Some(Token { tok: Tok::Newline, .. }))
            {
                continue;
            }
            out.push(token);
            if done {
                return Ok(out);
            }
        }
    }

    fn error(&self, line: u32, col: u32, message: impl Into<String>) -> SyntaxError {
        SyntaxError {
            path: self.path.to_string(),
            line,
            column: col,
            message: message.into(),
        }
    }

    fn peek(&self) -> Option<u8> {
        self.src.get(self.pos).copied()
    }

    fn bump(&mut self) -> Option<u8> {
        let c = self.peek()?;
        self.pos += 1;
        if c == b'\n' {
            self.line += 1;
            self.col = 1;
        } else {
            self.col += 1;
        }
        Some(c)
    }

    fn eat(&mut self, expected: u8) -> bool {
        if self.peek() == Some(expected) {
            self.bump();
            true
        } else {
            false
        }
    }

    fn next_token(&mut self) -> Result<Token, SyntaxError> {
        // Skip horizontal whitespace and comments.
        loop {
            match self.peek() {
                Some(b' ') | Some(b'\t') | Some(b'\r') => {
                    self.bump();
                }
                Some(b'#') => {
                    while let Some(c) = self.peek() {
                        if c == b'\n' {
                            break;
                        }
                        self.bump();
                    }
                }
                _ => break,
            }
        }

        let line = self.line;
        let col = self.col;
        let token = |tok| Token { tok, line, col };

        let c = match self.bump() {
            None => return Ok(token(Tok::Eof)),
            Some(c) => c,
        };

        let tok = match c {
            b'\n' => Tok::Newline,
            b';' => Tok::Newline,
            b'+' => Tok::Plus,
            b'-' => Tok::Minus,
            b'*' => Tok::Star,
            b'/' => Tok::Slash,
            b'%' => Tok::Percent,
            b',' => Tok::Comma,
            b'(' => Tok::LParen,
            b')' => Tok::RParen,
            b'[' => Tok::LBracket,
            b']' => Tok::RBracket,
            b'{' => Tok::LBrace,
            b'}' => Tok::RBrace,
            b'=' => {
                if self.eat(b'=') {
                    Tok::EqEq
                } else if self.eat(b'>') {
                    Tok::FatArrow
                } else {
                    Tok::Assign
                }
            }
            b'!' => {
                if self.eat(b'=') {
                    Tok::NotEq
                } else {
                    Tok::Bang
                }
            }
            b'<' => {
                if self.eat(b'=') {
                    Tok::Le
                } else {
                    Tok::Lt
                }
            }
            b'>' => {
                if self.eat(b'=') {
                    Tok::Ge
                } else {
                    Tok::Gt
                }
            }
            b'&' => {
                if self.eat(b'&') {
                    Tok::AndAnd
                } else {
                    return Err(self.error(line, col, "unexpected '&'"));
                }
            }
            b'|' => {
                if self.eat(b'|') {
                    Tok::OrOr
                } else {
                    return Err(self.error(line, col, "unexpected '|'"));
                }
            }
            b'"' => self.string(line, col)?,
            b':' => {
                if self
                    .peek()
                    .map(|c| c.is_ascii_alphabetic() || c == b'_')
                    .unwrap_or(false)
                {
                    Tok::Sym(self.ident_body())
                } else {
                    Tok::Colon
                }
            }
            b'@' => {
                if self
                    .peek()
                    .map(|c| c.is_ascii_alphabetic() || c == b'_')
                    .unwrap_or(false)
                {
                    Tok::Slot(self.ident_body())
                } else {
                    return Err(self.error(line, col, "expected name after '@'"));
                }
            }
            b'0'..=b'9' => self.number(c, line, col)?,
            c if c.is_ascii_alphabetic() || c == b'_' => {
                let mut word = String::new();
                word.push(c as char);
                word.push_str(&self.ident_body());
                keyword(&word).unwrap_or(Tok::Ident(word))
            }
            c => {
                return Err(self.error(line, col, format!("unexpected character {:?}", c as char)))
            }
        };
        Ok(token(tok))
    }

    fn ident_body(&mut self) -> String {
        let mut word = String::new();
        while let Some(c) = self.peek() {
            if c.is_ascii_alphanumeric() || c == b'_' {
                word.push(c as char);
                self.bump();
            } else {
                break;
            }
        }
        word
    }

    fn number(&mut self, first: u8, line: u32, col: u32) -> Result<Tok, SyntaxError> {
        let mut digits = String::new();
        digits.push(first as char);
        while let Some(c) = self.peek() {
            match c {
                b'0'..=b'9' => {
                    digits.push(c as char);
                    self.bump();
                }
                b'_' => {
                    self.bump();
                }
                _ => break,
            }
        }
        digits
            .parse::<i64>()
            .map(Tok::Int)
            .map_err(|_| self.error(line, col, "integer literal out of range"))
    }

    fn string(&mut self, line: u32, col: u32) -> Result<Tok, SyntaxError> {
        let mut out = String::new();
        loop {
            match self.bump() {
                None => return Err(self.error(line, col, "unterminated string literal")),
                Some(b'"') => return Ok(Tok::Str(out)),
                Some(b'\\') => match self.bump() {
                    Some(b'n') => out.push('\n'),
                    Some(b't') => out.push('\t'),
                    Some(b'"') => out.push('"'),
                    Some(b'\\') => out.push('\\'),
                    Some(b'0') => out.push('\0'),
                    Some(c) => {
                        return Err(self.error(
                            self.line,
                            self.col,
                            format!("unknown escape \\{}", c as char),
                        ))
                    }
                    None => return Err(self.error(line, col, "unterminated string literal")),
                },
                Some(c) if c < 0x80 => out.push(c as char),
                Some(c) => {
                    // Re-assemble a UTF-8 sequence.
                    let start = self.pos - 1;
                    let width = utf8_width(c);
                    for _ in 1..width {
                        self.bump();
                    }
                    match std::str::from_utf8(&self.src[start..self.pos]) {
                        Ok(s) => out.push_str(s),
                        Err(_) => {
                            return Err(self.error(line, col, "invalid UTF-8 in string literal"))
                        }
                    }
                }
            }
        }
    }
}

fn utf8_width(first: u8) -> usize {
    match first {
        0xC0..=0xDF => 2,
        0xE0..=0xEF => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(src: &str) -> Vec<Tok> {
        Lexer::new("test.rb", src)
            .tokenize()
            .unwrap()
            .into_iter()
            .map(|t| t.tok)
            .collect()
    }

    #[test]
    fn lexes_literals_and_operators() {
        assert_eq!(
            toks("x = 1 + 2"),
            vec![
                Tok::Ident("x".into()),
                Tok::Assign,
                Tok::Int(1),
                Tok::Plus,
                Tok::Int(2),
                Tok::Eof
            ]
        );
    }

    #[test]
    fn lexes_symbols_slots_and_strings() {
        assert_eq!(
            toks("@out = {:a => \"hi\\n\"}"),
            vec![
                Tok::Slot("out".into()),
                Tok::Assign,
                Tok::LBrace,
                Tok::Sym("a".into()),
                Tok::FatArrow,
                Tok::Str("hi\n".into()),
                Tok::RBrace,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn comments_and_blank_lines_collapse() {
        assert_eq!(
            toks("# header\n\n\n1\n"),
            vec![Tok::Int(1), Tok::Newline, Tok::Eof]
        );
    }

    #[test]
    fn tracks_positions() {
        let tokens = Lexer::new("test.rb", "a\n  b").tokenize().unwrap();
        assert_eq!((tokens[0].line, tokens[0].col), (1, 1));
        let b = tokens.iter().find(|t| t.tok == Tok::Ident("b".into())).unwrap();
        assert_eq!((b.line, b.col), (2, 3));
    }

    #[test]
    fn reports_unterminated_string() {
        let err = Lexer::new("test.rb", "\"oops").tokenize().unwrap_err();
        assert_eq!(err.line, 1);
        assert!(err.message.contains("unterminated"));
    }

    #[test]
    fn integer_overflow_is_an_error() {
        assert!(Lexer::new("test.rb", "99999999999999999999")
            .tokenize()
            .is_err());
    }
}
