use crate::lang::error::{ScriptError, ScriptResult};

const KEYWORDS: [&str; 35] = [
    "False", "None", "True", "and", "as", "assert", "async", "await", "break", "class",
    "continue", "def", "del", "elif", "else", "except", "finally", "for", "from", "global",
    "if", "import", "in", "is", "lambda", "nonlocal", "not", "or", "pass", "raise", "return",
    "try", "while", "with", "yield",
];

/// Longest operators first so `**=` wins over `**` and `*`.
const OPERATORS: [&str; 47] = [
    "**=", "//=", ">>=", "<<=", "...", "**", "//", "==", "!=", "<=", ">=", "->", "+=", "-=",
    "*=", "/=", "%=", "&=", "|=", "^=", ":=", "<<", ">>", "+", "-", "*", "/", "%", "<", ">",
    "=", "(", ")", "[", "]", "{", "}", ",", ":", ".", ";", "@", "&", "|", "^", "~", "!",
];

#[derive(Debug, Clone, PartialEq)]
pub enum Tok {
    Name(String),
    Keyword(&'static str),
    Int(i64),
    Float(f64),
    Str(String),
    /// Body of an f-string with escapes already processed.
    FStr(String),
    Op(&'static str),
    Newline,
    Indent,
    Dedent,
    Eof,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Token {
    pub tok: Tok,
    pub line: u32,
}

pub fn tokenize(source: &str) -> ScriptResult<Vec<Token>> {
    Lexer::new(source).run()
}

struct Lexer {
    chars: Vec<char>,
    pos: usize,
    line: u32,
    indents: Vec<usize>,
    depth: usize,
    tokens: Vec<Token>,
}

impl Lexer {
    fn new(source: &str) -> Self {
        Self {
            chars: source.chars().collect(),
            pos: 0,
            line: 1,
            indents: vec![0],
            depth: 0,
            tokens: Vec::new(),
        }
    }

    fn peek(&self) -> Option<char> {
        self.chars.get(self.pos).copied()
    }

    fn peek_at(&self, offset: usize) -> Option<char> {
        self.chars.get(self.pos + offset).copied()
    }

    fn push(&mut self, tok: Tok) {
        self.tokens.push(Token {
            tok,
            line: self.line,
        });
    }

    fn error(&self, message: impl Into<String>) -> ScriptError {
        ScriptError::syntax(message, self.line)
    }

    fn run(mut self) -> ScriptResult<Vec<Token>> {
        let mut at_line_start = true;
        while self.pos < self.chars.len() {
            if at_line_start && self.depth == 0 {
                at_line_start = false;
                if self.handle_indentation()? {
                    continue;
                }
            }
            let Some(c) = self.peek() else { break };
            match c {
                '\n' => {
                    self.pos += 1;
                    if self.depth == 0 {
                        self.end_logical_line();
                        at_line_start = true;
                    }
                    self.line += 1;
                }
                '\r' => self.pos += 1,
                ' ' | '\t' | '\x0c' => self.pos += 1,
                '#' => self.skip_comment(),
                '\\' => {
                    let next = self.peek_at(1);
                    if next == Some('\n') {
                        self.pos += 2;
                        self.line += 1;
                    } else if next == Some('\r') && self.peek_at(2) == Some('\n') {
                        self.pos += 3;
                        self.line += 1;
                    } else {
                        return Err(self.error("unexpected character after line continuation character"));
                    }
                }
                c if c.is_ascii_digit() => self.lex_number()?,
                '.' if self.peek_at(1).is_some_and(|d| d.is_ascii_digit()) => self.lex_number()?,
                c if c == '_' || c.is_alphabetic() => self.lex_name_or_string()?,
                '"' | '\'' => {
                    let text = self.lex_string_body(false)?;
                    self.push(Tok::Str(text));
                }
                _ => self.lex_operator()?,
            }
        }

        if self.depth > 0 {
            return Err(self.error("unexpected EOF while parsing"));
        }
        self.end_logical_line();
        while self.indents.len() > 1 {
            self.indents.pop();
            self.push(Tok::Dedent);
        }
        self.push(Tok::Eof);
        Ok(self.tokens)
    }

    fn end_logical_line(&mut self) {
        match self.tokens.last().map(|t| &t.tok) {
            None | Some(Tok::Newline) | Some(Tok::Indent) | Some(Tok::Dedent) => {}
            _ => self.push(Tok::Newline),
        }
    }

    fn skip_comment(&mut self) {
        while let Some(c) = self.peek() {
            if c == '\n' {
                break;
            }
            self.pos += 1;
        }
    }

    /// Measures leading whitespace. Returns true when the line is blank or
    /// a comment and was consumed.
    fn handle_indentation(&mut self) -> ScriptResult<bool> {
        let mut width = 0usize;
        while let Some(c) = self.peek() {
            match c {
                ' ' => width += 1,
                '\t' => width = (width / 8 + 1) * 8,
                '\x0c' => width = 0,
                _ => break,
            }
            self.pos += 1;
        }
        match self.peek() {
            None => return Ok(true),
            Some('#') => {
                self.skip_comment();
                return Ok(false);
            }
            Some('\n') | Some('\r') => return Ok(false),
            _ => {}
        }

        let current = self.indents.last().copied().unwrap_or(0);
        if width > current {
            if matches!(self.tokens.last().map(|t| &t.tok), None | Some(Tok::Newline))
                && !self.tokens.is_empty()
                && self.opens_block()
            {
                self.indents.push(width);
                self.push(Tok::Indent);
            } else {
                return Err(self.error("unexpected indent"));
            }
        } else if width < current {
            while self.indents.last().copied().unwrap_or(0) > width {
                self.indents.pop();
                self.push(Tok::Dedent);
            }
            if self.indents.last().copied().unwrap_or(0) != width {
                return Err(self.error("unindent does not match any outer indentation level"));
            }
        }
        Ok(false)
    }

    /// True when the previous logical line ended with `:`.
    fn opens_block(&self) -> bool {
        let n = self.tokens.len();
        n >= 2 && self.tokens[n - 2].tok == Tok::Op(":")
    }

    fn lex_name_or_string(&mut self) -> ScriptResult<()> {
        let start = self.pos;
        while let Some(c) = self.peek() {
            if c == '_' || c.is_alphanumeric() {
                self.pos += 1;
            } else {
                break;
            }
        }
        let word: String = self.chars[start..self.pos].iter().collect();

        if matches!(self.peek(), Some('"') | Some('\'')) {
            let prefix = word.to_ascii_lowercase();
            match prefix.as_str() {
                "r" | "u" | "f" | "rf" | "fr" => {
                    let raw = prefix.contains('r');
                    let text = self.lex_string_body(raw)?;
                    if prefix.contains('f') {
                        self.push(Tok::FStr(text));
                    } else {
                        self.push(Tok::Str(text));
                    }
                    return Ok(());
                }
                "b" | "br" | "rb" => {
                    return Err(self.error("bytes literals are not supported"));
                }
                _ => {}
            }
        }

        match KEYWORDS.iter().find(|k| **k == word) {
            Some(keyword) => self.push(Tok::Keyword(keyword)),
            None => self.push(Tok::Name(word)),
        }
        Ok(())
    }

    fn lex_string_body(&mut self, raw: bool) -> ScriptResult<String> {
        let quote = self.peek().ok_or_else(|| self.error("expected string"))?;
        let triple = self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote);
        let start_line = self.line;
        self.pos += if triple { 3 } else { 1 };

        let mut out = String::new();
        loop {
            let Some(c) = self.peek() else {
                return Err(ScriptError::syntax(
                    "unterminated string literal",
                    start_line,
                ));
            };
            if c == quote {
                if !triple {
                    self.pos += 1;
                    return Ok(out);
                }
                if self.peek_at(1) == Some(quote) && self.peek_at(2) == Some(quote) {
                    self.pos += 3;
                    return Ok(out);
                }
            }
            if c == '\n' {
                if !triple {
                    return Err(ScriptError::syntax(
                        "unterminated string literal",
                        start_line,
                    ));
                }
                self.line += 1;
            }
            if c == '\\' {
                let next = self.peek_at(1);
                if raw {
                    out.push('\\');
                    if let Some(n) = next {
                        out.push(n);
                        if n == '\n' {
                            self.line += 1;
                        }
                        self.pos += 2;
                    } else {
                        self.pos += 1;
                    }
                    continue;
                }
                self.pos += 1;
                self.lex_escape(&mut out)?;
                continue;
            }
            out.push(c);
            self.pos += 1;
        }
    }

    /// Consumes one escape sequence; the backslash is already consumed.
    fn lex_escape(&mut self, out: &mut String) -> ScriptResult<()> {
        let Some(c) = self.peek() else {
            return Err(self.error("unterminated string literal"));
        };
        self.pos += 1;
        match c {
            '\n' => self.line += 1,
            'n' => out.push('\n'),
            't' => out.push('\t'),
            'r' => out.push('\r'),
            '0' => out.push('\0'),
            'a' => out.push('\x07'),
            'b' => out.push('\x08'),
            'f' => out.push('\x0c'),
            'v' => out.push('\x0b'),
            '\\' => out.push('\\'),
            '\'' => out.push('\''),
            '"' => out.push('"'),
            'x' => out.push(self.lex_hex_escape(2)?),
            'u' => out.push(self.lex_hex_escape(4)?),
            'U' => out.push(self.lex_hex_escape(8)?),
            other => {
                out.push('\\');
                out.push(other);
            }
        }
        Ok(())
    }

    fn lex_hex_escape(&mut self, digits: usize) -> ScriptResult<char> {
        let mut code = 0u32;
        for _ in 0..digits {
            let d = self
                .peek()
                .and_then(|c| c.to_digit(16))
                .ok_or_else(|| self.error("truncated escape sequence"))?;
            code = code * 16 + d;
            self.pos += 1;
        }
        char::from_u32(code).ok_or_else(|| self.error("invalid unicode escape"))
    }

    fn take_digits(&mut self, radix: u32) -> String {
        let mut digits = String::new();
        while let Some(c) = self.peek() {
            if c == '_' {
                self.pos += 1;
            } else if c.is_digit(radix) {
                digits.push(c);
                self.pos += 1;
            } else {
                break;
            }
        }
        digits
    }

    fn lex_number(&mut self) -> ScriptResult<()> {
        if self.peek() == Some('0') {
            let radix = match self.peek_at(1) {
                Some('x') | Some('X') => Some(16),
                Some('o') | Some('O') => Some(8),
                Some('b') | Some('B') => Some(2),
                _ => None,
            };
            if let Some(radix) = radix {
                self.pos += 2;
                let digits = self.take_digits(radix);
                let value = i64::from_str_radix(&digits, radix)
                    .map_err(|_| self.error("invalid or too large integer literal"))?;
                self.push(Tok::Int(value));
                return Ok(());
            }
        }

        let mut text = self.take_digits(10);
        let mut is_float = false;
        if self.peek() == Some('.') && self.peek_at(1) != Some('.') {
            is_float = true;
            self.pos += 1;
            text.push('.');
            text.push_str(&self.take_digits(10));
        }
        if matches!(self.peek(), Some('e') | Some('E')) {
            let sign = self.peek_at(1);
            let has_digits = match sign {
                Some('+') | Some('-') => self.peek_at(2).is_some_and(|c| c.is_ascii_digit()),
                Some(c) => c.is_ascii_digit(),
                None => false,
            };
            if has_digits {
                is_float = true;
                self.pos += 1;
                text.push('e');
                if let Some(s @ ('+' | '-')) = self.peek() {
                    text.push(s);
                    self.pos += 1;
                }
                text.push_str(&self.take_digits(10));
            }
        }
        if matches!(self.peek(), Some('j') | Some('J')) {
            return Err(self.error("complex numbers are not supported"));
        }
        if self.peek().is_some_and(|c| c.is_alphabetic() || c == '_') {
            return Err(self.error("invalid decimal literal"));
        }

        if is_float {
            let value: f64 = text
                .parse()
                .map_err(|_| self.error("invalid float literal"))?;
            self.push(Tok::Float(value));
        } else {
            let value: i64 = text
                .parse()
                .map_err(|_| self.error("integer literal is too large"))?;
            self.push(Tok::Int(value));
        }
        Ok(())
    }

    fn lex_operator(&mut self) -> ScriptResult<()> {
        for op in OPERATORS {
            let len = op.chars().count();
            let matches = op
                .chars()
                .enumerate()
                .all(|(i, ch)| self.peek_at(i) == Some(ch));
            if !matches {
                continue;
            }
            if op == "!" {
                return Err(self.error("invalid syntax"));
            }
            match op {
                "(" | "[" | "{" => self.depth += 1,
                ")" | "]" | "}" => {
                    if self.depth == 0 {
                        return Err(self.error(format!("unmatched '{op}'")));
                    }
                    self.depth -= 1;
                }
                _ => {}
            }
            self.pos += len;
            self.push(Tok::Op(op));
            return Ok(());
        }
        let c = self.peek().unwrap_or('?');
        Err(self.error(format!("invalid character '{c}'")))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn toks(source: &str) -> Vec<Tok> {
        tokenize(source).unwrap().into_iter().map(|t| t.tok).collect()
    }

    #[test]
    fn indentation_produces_indent_and_dedent() {
        let got = toks("if x:\n    y = 1\nz\n");
        assert_eq!(
            got,
            vec![
                Tok::Keyword("if"),
                Tok::Name("x".into()),
                Tok::Op(":"),
                Tok::Newline,
                Tok::Indent,
                Tok::Name("y".into()),
                Tok::Op("="),
                Tok::Int(1),
                Tok::Newline,
                Tok::Dedent,
                Tok::Name("z".into()),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn newlines_inside_brackets_are_ignored() {
        let got = toks("x = [1,\n  2]\n");
        assert_eq!(got.iter().filter(|t| **t == Tok::Newline).count(), 1);
    }

    #[test]
    fn numbers_and_strings() {
        assert_eq!(
            toks("1_000 0xff 2.5 1e3 'a\\n' r'a\\n' f'{x}'"),
            vec![
                Tok::Int(1000),
                Tok::Int(255),
                Tok::Float(2.5),
                Tok::Float(1000.0),
                Tok::Str("a\n".into()),
                Tok::Str("a\\n".into()),
                Tok::FStr("{x}".into()),
                Tok::Newline,
                Tok::Eof,
            ]
        );
    }

    #[test]
    fn ellipsis_and_compound_operators() {
        assert_eq!(
            toks("x **= ..."),
            vec![
                Tok::Name("x".into()),
                Tok::Op("**="),
                Tok::Op("..."),
                Tok::Newline,
                Tok::Eof
            ]
        );
    }

    #[test]
    fn blank_and_comment_lines_do_not_affect_indentation() {
        let got = toks("def f():\n\n    # note\n    return 1\n");
        assert!(got.contains(&Tok::Indent));
        assert_eq!(got.iter().filter(|t| **t == Tok::Dedent).count(), 1);
    }

    #[test]
    fn errors_carry_line_numbers() {
        let err = tokenize("x = 1\ny = 'open\n").unwrap_err();
        assert_eq!(err.line, Some(2));
        assert!(err.message.contains("unterminated"));

        let err = tokenize("x = 1\n    y = 2\n").unwrap_err();
        assert_eq!(err.message, "unexpected indent");

        let err = tokenize("if x:\n        a\n    b\n").unwrap_err();
        assert!(err.message.contains("unindent"));
    }

    #[test]
    fn unbalanced_brackets_are_rejected() {
        assert!(tokenize("x = (1, 2\n").is_err());
        assert!(tokenize("x = 1)\n").is_err());
    }
}
