//! Linear pre-parse scan that bounds how deeply a script can nest.
//!
//! Parsing, walking and dropping a syntax tree all recurse once per level, so
//! a small script made of nothing but brackets or prefix operators can exhaust
//! the thread stack. The scan tokenizes just enough (strings, comments,
//! numbers, brackets, operators) to estimate the nesting depth of every
//! expression and rejects the script before it reaches the parser.

/// Deepest bracket nesting accepted.
pub const MAX_BRACKET_DEPTH: usize = 200;

/// Deepest estimated expression nesting accepted.
pub const MAX_EXPRESSION_DEPTH: usize = 400;

/// Deepest block indentation accepted.
pub const MAX_INDENT_LEVELS: usize = 100;

/// Keywords that add a level to the expression they appear in.
const NESTING_KEYWORDS: &[&str] = &["and", "or", "not", "if", "else", "lambda", "in", "is", "await"];

const OPERATOR_CHARS: &[u8] = b"+-*/%@&|^~<>!=.";

/// A nesting limit the script exceeds, with its 1-based line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NestingViolation {
    pub message: &'static str,
    pub line: usize,
}

/// First nesting limit `source` exceeds, if any.
///
/// Malformed input (unterminated strings, unbalanced brackets) is scanned on a
/// best-effort basis and left for the parser to report.
pub fn check_nesting(source: &str) -> Option<NestingViolation> {
    Scanner::new(source.as_bytes()).run().err()
}

struct Scanner<'a> {
    bytes: &'a [u8],
    pos: usize,
    line: usize,
    /// Operator chain lengths of the enclosing bracket levels.
    enclosing: Vec<usize>,
    enclosing_sum: usize,
    /// Operator chain length at the current bracket level.
    chain: usize,
    indents: Vec<usize>,
    at_line_start: bool,
}

type Scan = Result<(), NestingViolation>;

impl<'a> Scanner<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self {
            bytes,
            pos: 0,
            line: 1,
            enclosing: Vec::new(),
            enclosing_sum: 0,
            chain: 0,
            indents: vec![0],
            at_line_start: true,
        }
    }

    fn peek(&self, offset: usize) -> Option<u8> {
        self.bytes.get(self.pos + offset).copied()
    }

    fn violation(&self, message: &'static str) -> NestingViolation {
        NestingViolation {
            message,
            line: self.line,
        }
    }

    fn run(mut self) -> Scan {
        while let Some(c) = self.peek(0) {
            if self.at_line_start {
                self.indentation()?;
                continue;
            }
            match c {
                b'\n' => {
                    self.pos += 1;
                    self.line += 1;
                    if self.enclosing.is_empty() {
                        self.chain = 0;
                        self.at_line_start = true;
                    }
                }
                b'\\' => self.continuation(),
                b'#' => self.comment(),
                b'\'' | b'"' => self.string(false)?,
                b'0'..=b'9' => self.number(),
                b'.' if self.peek(1).is_some_and(|n| n.is_ascii_digit()) => self.number(),
                b'(' | b'[' | b'{' => self.open()?,
                b')' | b']' | b'}' => self.close(),
                b',' | b';' => {
                    self.chain = 0;
                    self.pos += 1;
                }
                b':' => {
                    self.pos += 1;
                    if self.peek(0) == Some(b'=') {
                        self.pos += 1;
                        self.extend_chain(1)?;
                    }
                }
                c if is_ident_byte(c) => self.word()?,
                c if OPERATOR_CHARS.contains(&c) => self.operator()?,
                _ => self.pos += 1,
            }
        }
        Ok(())
    }

    /// Measure the indentation of a new logical line. Blank and comment-only
    /// lines do not open or close blocks.
    fn indentation(&mut self) -> Scan {
        let start = self.pos;
        while matches!(self.peek(0), Some(b' ' | b'\t' | b'\x0c')) {
            self.pos += 1;
        }
        self.at_line_start = false;
        if matches!(self.peek(0), None | Some(b'\n' | b'\r' | b'#')) {
            return Ok(());
        }

        let width = self.pos - start;
        while self.indents.last().is_some_and(|&top| top > width) {
            self.indents.pop();
        }
        if self.indents.last().is_none_or(|&top| top < width) {
            self.indents.push(width);
        }
        if self.indents.len() - 1 > MAX_INDENT_LEVELS {
            return Err(self.violation("too many levels of indentation"));
        }
        Ok(())
    }

    fn continuation(&mut self) {
        self.pos += 1;
        if self.peek(0) == Some(b'\r') {
            self.pos += 1;
        }
        if self.peek(0) == Some(b'\n') {
            self.pos += 1;
            self.line += 1;
        }
    }

    fn comment(&mut self) {
        while self.peek(0).is_some_and(|c| c != b'\n') {
            self.pos += 1;
        }
    }

    fn number(&mut self) {
        while let Some(c) = self.peek(0) {
            if matches!(c, b'e' | b'E') && matches!(self.peek(1), Some(b'+' | b'-')) {
                self.pos += 2;
            } else if c.is_ascii_alphanumeric() || c == b'_' || c == b'.' {
                self.pos += 1;
            } else {
                break;
            }
        }
    }

    fn word(&mut self) -> Scan {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| is_ident_byte(c) || c.is_ascii_digit()) {
            self.pos += 1;
        }
        let word = &self.bytes[start..self.pos];

        if matches!(self.peek(0), Some(b'\'' | b'"')) && is_string_prefix(word) {
            let formatted = word.iter().any(|c| c.eq_ignore_ascii_case(&b'f'));
            return self.string(formatted);
        }
        if NESTING_KEYWORDS.iter().any(|k| k.as_bytes() == word) {
            self.extend_chain(1)?;
        }
        Ok(())
    }

    /// Skip a string literal. Replacement fields of f-strings are bounded by
    /// the bracket limit on their own.
    fn string(&mut self, formatted: bool) -> Scan {
        let Some(quote) = self.peek(0) else {
            return Ok(());
        };
        let triple = self.peek(1) == Some(quote) && self.peek(2) == Some(quote);
        self.pos += if triple { 3 } else { 1 };

        let mut depth = 0usize;
        while let Some(c) = self.peek(0) {
            match c {
                b'\\' => {
                    if self.peek(1) == Some(b'\n') {
                        self.line += 1;
                    }
                    self.pos += 2;
                    continue;
                }
                b'\n' => {
                    if !triple {
                        // Unterminated; the parser reports it.
                        return Ok(());
                    }
                    self.line += 1;
                }
                c if c == quote => {
                    if !triple {
                        self.pos += 1;
                        return Ok(());
                    }
                    if self.peek(1) == Some(quote) && self.peek(2) == Some(quote) {
                        self.pos += 3;
                        return Ok(());
                    }
                }
                b'{' | b'(' | b'[' if formatted => {
                    depth += 1;
                    if depth > MAX_BRACKET_DEPTH {
                        return Err(self.violation("too many nested parentheses"));
                    }
                }
                b'}' | b')' | b']' if formatted => depth = depth.saturating_sub(1),
                _ => {}
            }
            self.pos += 1;
        }
        Ok(())
    }

    fn open(&mut self) -> Scan {
        self.pos += 1;
        if self.enclosing.len() >= MAX_BRACKET_DEPTH {
            return Err(self.violation("too many nested parentheses"));
        }
        // A bracket after an operand is a call or subscript on it.
        self.extend_chain(1)?;
        self.enclosing.push(self.chain);
        self.enclosing_sum += self.chain;
        self.chain = 0;
        Ok(())
    }

    fn close(&mut self) {
        self.pos += 1;
        if let Some(outer) = self.enclosing.pop() {
            self.enclosing_sum -= outer;
            self.chain = outer;
        }
    }

    fn operator(&mut self) -> Scan {
        let start = self.pos;
        while self.peek(0).is_some_and(|c| OPERATOR_CHARS.contains(&c)) {
            self.pos += 1;
        }
        let run = &self.bytes[start..self.pos];
        if run == b"=" {
            self.chain = 0;
            return Ok(());
        }
        self.extend_chain(run.len())
    }

    fn extend_chain(&mut self, levels: usize) -> Scan {
        self.chain += levels;
        if self.enclosing.len() + self.enclosing_sum + self.chain > MAX_EXPRESSION_DEPTH {
            return Err(self.violation("expression too deeply nested"));
        }
        Ok(())
    }
}

fn is_ident_byte(c: u8) -> bool {
    c.is_ascii_alphabetic() || c == b'_' || c >= 0x80
}

fn is_string_prefix(word: &[u8]) -> bool {
    !word.is_empty()
        && word.len() <= 2
        && word
            .iter()
            .all(|c| matches!(c.to_ascii_lowercase(), b'r' | b'b' | b'u' | b'f'))
}
